//! Device ordinals.

use std::fmt;

/// A device's ordinal, identifying which logical group it belongs to and
/// its position within that group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ordinal {
    pub group: i32,
    pub controller: i32,
}

impl Ordinal {
    /// The ordinal of a device that has none.
    pub const INVALID: Ordinal = Ordinal {
        group: -1,
        controller: -1,
    };

    pub const fn new(group: i32, controller: i32) -> Self {
        Ordinal { group, controller }
    }

    /// An ordinal is valid iff both its group and controller are >= 0.
    pub fn is_valid(&self) -> bool {
        self.group >= 0 && self.controller >= 0
    }
}

impl Default for Ordinal {
    fn default() -> Self {
        Ordinal::INVALID
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "{{INVALID}}");
        }
        write!(f, "{{Grp={}, Cont={}}}", self.group, self.controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_requires_both_members() {
        assert!(Ordinal::new(0, 0).is_valid());
        assert!(Ordinal::new(3, 7).is_valid());
        assert!(!Ordinal::new(-1, 0).is_valid());
        assert!(!Ordinal::new(0, -1).is_valid());
        assert!(!Ordinal::INVALID.is_valid());
    }

    #[test]
    fn renders_invalid_ordinals() {
        assert_eq!(Ordinal::new(2, 5).to_string(), "{Grp=2, Cont=5}");
        assert_eq!(Ordinal::INVALID.to_string(), "{INVALID}");
        assert_eq!(Ordinal::new(-3, 9).to_string(), "{INVALID}");
    }
}
