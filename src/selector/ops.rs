use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use mio::Interest;

/// Interest flags of a registered descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const ACCEPT: Ops = Ops(1);
    pub const CONNECT: Ops = Ops(1 << 1);
    pub const READ: Ops = Ops(1 << 2);
    pub const WRITE: Ops = Ops(1 << 3);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Ops) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn with(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }

    pub fn without(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }

    /// The poller interest for these flags, `None` when nothing is wanted.
    ///
    /// Accept and read both wait for readability; connect and write both
    /// wait for writability.
    pub(crate) fn interest(self) -> Option<Interest> {
        let readable = self.0 & (Ops::ACCEPT.0 | Ops::READ.0) != 0;
        let writable = self.0 & (Ops::CONNECT.0 | Ops::WRITE.0) != 0;
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        self.with(rhs)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Ops::ACCEPT, "ACCEPT"),
            (Ops::CONNECT, "CONNECT"),
            (Ops::READ, "READ"),
            (Ops::WRITE, "WRITE"),
        ]
        .into_iter()
        .filter(|(op, _)| self.contains(*op))
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}
