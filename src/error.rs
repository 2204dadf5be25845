//! Error classes shared by the store and the attention engine.
//!
//! Each module keeps its own error enum; this only fixes how those errors
//! are grouped and which negative status code they report across the
//! status-code boundary.

use serde::Serialize;

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorClass {
    /// Invalid dimensions, paths or parameters. Fatal to the call only.
    Config,
    /// Host or disk budget cannot hold the requested write.
    Budget,
    /// Out-of-range layer, position outside the stored range, absent data.
    Addressing,
    /// Accelerator allocation, stream failure, poisoned state.
    Device,
}

impl ErrorClass {
    /// Negative status code reported for this class.
    pub fn status(&self) -> i32 {
        match self {
            ErrorClass::Config => -1,
            ErrorClass::Budget => -2,
            ErrorClass::Addressing => -3,
            ErrorClass::Device => -4,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Config => write!(f, "config"),
            ErrorClass::Budget => write!(f, "budget"),
            ErrorClass::Addressing => write!(f, "addressing"),
            ErrorClass::Device => write!(f, "device"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_negative_and_distinct() {
        let classes = [
            ErrorClass::Config,
            ErrorClass::Budget,
            ErrorClass::Addressing,
            ErrorClass::Device,
        ];
        for (i, a) in classes.iter().enumerate() {
            assert!(a.status() < 0);
            for b in &classes[i + 1..] {
                assert_ne!(a.status(), b.status());
            }
        }
    }
}
