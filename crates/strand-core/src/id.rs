//! Job and task identifier types

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Sentinel value meaning "no id"
            pub const NONE: $name = $name(0);

            /// Allocate the next process-unique id (never returns `NONE`)
            #[inline]
            pub fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                $name(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Wrap a raw value
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            /// Get the raw u64 value
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            pub const fn is_none(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub const fn is_some(self) -> bool {
                self.0 != 0
            }

            /// Convert to Option
            #[inline]
            pub const fn to_option(self) -> Option<$name> {
                if self.is_none() {
                    None
                } else {
                    Some(self)
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, concat!(stringify!($name), "(NONE)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_none() {
                    write!(f, "none")
                } else {
                    write!(f, concat!($label, "{}"), self.0)
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::NONE
            }
        }
    };
}

define_id!(
    /// Identifier of a node in the job tree
    JobId,
    "j"
);

define_id!(
    /// Identifier of one logical task (one suspendable computation)
    ///
    /// A task owns exactly one job, but scoped blocks such as `with_timeout`
    /// run under nested jobs while keeping the same task id. Ownership checks
    /// (e.g. reentrant mutex detection) use the task id.
    TaskId,
    "t"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = JobId::next();
        let b = JobId::next();
        assert_ne!(a, b);
        assert!(a.is_some());
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(TaskId::NONE.is_none());
        assert_eq!(TaskId::default(), TaskId::NONE);
        assert_eq!(TaskId::NONE.to_option(), None);
        assert_eq!(format!("{}", TaskId::NONE), "none");
    }

    #[test]
    fn test_display() {
        let id = JobId::from_raw(17);
        assert_eq!(format!("{}", id), "j17");
        assert_eq!(format!("{:?}", id), "JobId(17)");
        assert_eq!(format!("{}", TaskId::from_raw(3)), "t3");
    }
}
