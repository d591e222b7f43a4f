use tracing::Level;

use agentdock_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};

use crate::AdmissionError;

pub const DEFAULT_MAX_INSTRUCTION_LENGTH: usize = 5000;

/// Checks an instruction before anything is created for it. The length
/// check runs before the blank check, so an over-long run of whitespace
/// reports the length problem.
pub fn validate_instruction(raw: Option<&str>, max_length: usize) -> Result<&str, AdmissionError> {
    let result = check(raw, max_length);
    if let Err(err) = &result {
        let detail = format!(
            "{err}; length={} preview={}",
            raw.map(|s| s.chars().count()).unwrap_or(0),
            redact_text(raw.unwrap_or(""))
        );
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent::new("instruction.rejected", "orchestrator.validation")
                .error_code(err.error_code())
                .detail(&detail),
        );
    }
    result
}

fn check(raw: Option<&str>, max_length: usize) -> Result<&str, AdmissionError> {
    let instruction = match raw {
        Some(s) if !s.is_empty() => s,
        _ => {
            return Err(AdmissionError::Validation(
                "Instruction is required and must be a string".to_string(),
            ))
        }
    };
    if instruction.chars().count() > max_length {
        return Err(AdmissionError::Validation(format!(
            "Instruction is too long. Maximum length is {max_length} characters."
        )));
    }
    if instruction.trim().is_empty() {
        return Err(AdmissionError::Validation(
            "Instruction cannot be empty".to_string(),
        ));
    }
    Ok(instruction)
}
