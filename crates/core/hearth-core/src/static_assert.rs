//! Compile-time static assertion macro.

/// Asserts a condition at compile time.
///
/// # Examples
///
/// ```ignore
/// use hearth_core::static_assert;
/// static_assert!(NOFILE >= 3, "stdio needs three descriptors");
/// ```
#[macro_export]
macro_rules! static_assert {
    ($cond:expr $(,)?) => {
        const _: () = assert!($cond);
    };
    ($cond:expr, $msg:expr $(,)?) => {
        const _: () = assert!($cond, $msg);
    };
}

#[cfg(test)]
mod tests {
    static_assert!(core::mem::size_of::<u32>() == 4);
    static_assert!(crate::cpu_local::MAX_CPUS.is_power_of_two(), "slot pool is sized in powers of two");

    #[test]
    fn assertions_compile() {}
}
