use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

impl CoreError {
    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::unknown("step type", "teleport");
        assert_eq!(error.to_string(), "Unknown step type: 'teleport'");
    }
}
