//! Saved user registers.

/// User register state saved on entry to the kernel.
///
/// Only the registers the process core touches are modelled: the resume
/// address, the stack pointer and the argument/return registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// User program counter to resume at.
    pub epc: u64,
    /// User stack pointer.
    pub sp: u64,
    /// Argument registers; `a0` doubles as the syscall return value.
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    /// Syscall number.
    pub a7: u64,
}

impl TrapFrame {
    /// Stores a syscall return value in `a0`.
    #[allow(clippy::cast_sign_loss)]
    pub fn set_return(&mut self, value: i64) {
        self.a0 = value as u64;
    }

    /// Reads `a0` as a signed syscall return value.
    #[allow(clippy::cast_possible_wrap)]
    pub fn ret(&self) -> i64 {
        self.a0 as i64
    }

    /// Returns argument register `n` (0..=5).
    ///
    /// # Panics
    ///
    /// Panics if `n` is not an argument register.
    pub fn arg(&self, n: usize) -> u64 {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("argraw: bad argument index {n}"),
        }
    }
}

hearth_core::static_assert!(core::mem::size_of::<TrapFrame>() == 10 * 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_return_round_trips() {
        let mut tf = TrapFrame::default();
        tf.set_return(-1);
        assert_eq!(tf.a0, u64::MAX);
        assert_eq!(tf.ret(), -1);
    }

    #[test]
    fn args_map_to_registers() {
        let tf = TrapFrame {
            a0: 10,
            a3: 13,
            a5: 15,
            ..TrapFrame::default()
        };
        assert_eq!(tf.arg(0), 10);
        assert_eq!(tf.arg(3), 13);
        assert_eq!(tf.arg(5), 15);
    }

    #[test]
    #[should_panic(expected = "bad argument index")]
    fn arg_six_is_not_an_argument() {
        TrapFrame::default().arg(6);
    }
}
