//! Runtime checks for unsafe preconditions.
//!
//! [`assert_unsafe_precondition!`] guards conditions that must hold for
//! the following unsafe code to be sound, such as "this CPU really holds
//! the lock whose guard is being re-materialised".
//!
//! | Build configuration | Result |
//! |---------------------|--------|
//! | Debug (`debug_assertions`) | Panics on failure |
//! | Release + `hearth_hardened` cfg | Panics on failure |
//! | Release (default) | Compiled away (condition still type-checked) |

/// Checks a precondition that must hold for subsequent `unsafe` code to be
/// sound.
///
/// Use `debug_assert!` for plain logic invariants; use this macro when the
/// violation would be undefined behavior.
#[macro_export]
macro_rules! assert_unsafe_precondition {
    ($cond:expr $(,)?) => {
        #[cfg(any(debug_assertions, hearth_hardened))]
        {
            if !$cond {
                panic!(
                    "unsafe precondition violated: {}",
                    stringify!($cond),
                );
            }
        }
        #[cfg(not(any(debug_assertions, hearth_hardened)))]
        {
            if false {
                let _ = $cond;
            }
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        #[cfg(any(debug_assertions, hearth_hardened))]
        {
            if !$cond {
                panic!($($arg)+);
            }
        }
        #[cfg(not(any(debug_assertions, hearth_hardened)))]
        {
            if false {
                let _ = $cond;
            }
        }
    };
}
