//! Agent identity validation
//!
//! The agent id doubles as the `serverId` on every wire record and as part
//! of the per-agent command queue name, so it is restricted to a character
//! set that is safe in AMQP names, URLs and file paths.

use thiserror::Error;

pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for agent identities
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_valid_agent_id_format(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_agent_id(&id).is_ok(), "Valid agent ID should pass: {}", id);
        }

        #[test]
        fn test_invalid_agent_id_chars(id in "[^a-zA-Z0-9._-]{1}[a-zA-Z0-9._-]*") {
            prop_assert!(validate_agent_id(&id).is_err(), "Invalid agent ID should fail: {}", id);
        }
    }

    #[test]
    fn test_agent_id_validation_examples() {
        assert!(validate_agent_id("srv-01").is_ok());
        assert!(validate_agent_id("host_123.eu-west").is_ok());
        assert!(validate_agent_id("64f1c0a2b7e9d3").is_ok());

        assert_eq!(validate_agent_id(""), Err(ValidationError::EmptyAgentId));
        assert!(validate_agent_id("srv@host").is_err());
        assert!(validate_agent_id("srv host").is_err());
        assert!(validate_agent_id("srv/path").is_err());
        assert!(validate_agent_id("srv:5672").is_err());
    }

    #[test]
    fn test_agent_id_validation_reports_offending_char() {
        match validate_agent_id("test#host") {
            Err(ValidationError::InvalidAgentIdChar(ch)) => assert_eq!(ch, '#'),
            other => panic!("Expected InvalidAgentIdChar error, got {other:?}"),
        }
    }
}
