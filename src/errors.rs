/// Error codes shared between the compile driver and generated code.
///
/// Generated code materializes these into the error-code register before
/// jumping to the shared report routine, so the numeric values are part of
/// the code's ABI and must stay stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,
    OutOfMemory = 1,
    InvalidAddress = 2,
    Timeout = 3,
    DivideByZero = 4,
    StackLow = 5,
    StackMin = 6,
    ArrayBounds = 7,
    MemAccess = 8,
    HeapLow = 9,
    HeapMin = 10,
    IntegerOverflow = 11,
    InvalidNative = 12,
    InvalidInstruction = 13,
}

pub const MAX_ERROR_CODES: usize = 14;

impl ErrorCode {
    pub fn from_i32(raw: i32) -> Option<ErrorCode> {
        let code = match raw {
            0 => ErrorCode::None,
            1 => ErrorCode::OutOfMemory,
            2 => ErrorCode::InvalidAddress,
            3 => ErrorCode::Timeout,
            4 => ErrorCode::DivideByZero,
            5 => ErrorCode::StackLow,
            6 => ErrorCode::StackMin,
            7 => ErrorCode::ArrayBounds,
            8 => ErrorCode::MemAccess,
            9 => ErrorCode::HeapLow,
            10 => ErrorCode::HeapMin,
            11 => ErrorCode::IntegerOverflow,
            12 => ErrorCode::InvalidNative,
            13 => ErrorCode::InvalidInstruction,
            _ => return None,
        };
        Some(code)
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::None => "no error",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::InvalidAddress => "invalid code address",
            ErrorCode::Timeout => "script execution timed out",
            ErrorCode::DivideByZero => "divide by zero",
            ErrorCode::StackLow => "stack overflowed into heap",
            ErrorCode::StackMin => "stack underflowed past its base",
            ErrorCode::ArrayBounds => "array index out of bounds",
            ErrorCode::MemAccess => "invalid memory access",
            ErrorCode::HeapLow => "heap overflowed into stack",
            ErrorCode::HeapMin => "heap underflowed past the data section",
            ErrorCode::IntegerOverflow => "integer overflow",
            ErrorCode::InvalidNative => "native is not bound",
            ErrorCode::InvalidInstruction => "invalid instruction",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_raw_values() {
        for raw in 0..MAX_ERROR_CODES as i32 {
            let code = ErrorCode::from_i32(raw).expect("raw value should map to a code");
            assert_eq!(code as i32, raw);
        }
        assert_eq!(ErrorCode::from_i32(MAX_ERROR_CODES as i32), None);
        assert_eq!(ErrorCode::from_i32(-1), None);
    }
}
