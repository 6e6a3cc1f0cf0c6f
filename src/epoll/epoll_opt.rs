use std::{fmt, ops};

/// Options controlling how a registration behaves across repeated wakeups.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct EpollOpt(usize);

const EDGE: usize = 0b0001;
const LEVEL: usize = 0b0010;
const ONESHOT: usize = 0b0100;

impl EpollOpt {
    #[inline]
    pub fn empty() -> EpollOpt {
        EpollOpt(0)
    }

    #[inline]
    pub fn edge() -> EpollOpt {
        EpollOpt(EDGE)
    }

    #[inline]
    pub fn level() -> EpollOpt {
        EpollOpt(LEVEL)
    }

    #[inline]
    pub fn oneshot() -> EpollOpt {
        EpollOpt(ONESHOT)
    }

    #[inline]
    pub fn is_edge(&self) -> bool {
        self.contains(EpollOpt(EDGE))
    }

    #[inline]
    pub fn is_level(&self) -> bool {
        self.contains(EpollOpt(LEVEL))
    }

    #[inline]
    pub fn is_oneshot(&self) -> bool {
        self.contains(EpollOpt(ONESHOT))
    }

    #[inline]
    pub fn contains(&self, other: EpollOpt) -> bool {
        (*self & other) == other
    }
}

impl ops::BitOr for EpollOpt {
    type Output = EpollOpt;

    #[inline]
    fn bitor(self, other: EpollOpt) -> EpollOpt {
        EpollOpt(self.0 | other.0)
    }
}

impl ops::BitAnd for EpollOpt {
    type Output = EpollOpt;

    #[inline]
    fn bitand(self, other: EpollOpt) -> EpollOpt {
        EpollOpt(self.0 & other.0)
    }
}

impl fmt::Debug for EpollOpt {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (EpollOpt::edge(), "Edge-triggered"),
            (EpollOpt::level(), "Level-triggered"),
            (EpollOpt::oneshot(), "Oneshot"),
        ];

        write!(fmt, "EpollOpt {{")?;
        let mut first = true;
        for (flag, name) in flags {
            if self.contains(flag) {
                if !first {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                first = false;
            }
        }
        write!(fmt, "}}")
    }
}
