//! Input validation for display names and chat text

use rand::Rng;

use crate::error::AppError;

pub const DISPLAY_NAME_MIN: usize = 2;
pub const DISPLAY_NAME_MAX: usize = 15;

/// Substrings a chosen display name may not contain (case-insensitive)
const RESERVED_WORDS: [&str; 5] = ["admin", "mod", "moderator", "system", "bot"];

/// Validate a requested display name, returning the trimmed form
pub fn validate_display_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    let len = name.chars().count();

    if len < DISPLAY_NAME_MIN {
        return Err(AppError::InvalidInput(format!(
            "display name must be at least {} characters",
            DISPLAY_NAME_MIN
        )));
    }
    if len > DISPLAY_NAME_MAX {
        return Err(AppError::InvalidInput(format!(
            "display name must be at most {} characters",
            DISPLAY_NAME_MAX
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::InvalidInput(
            "display name may only contain letters, digits and _".to_string(),
        ));
    }

    let lower = name.to_ascii_lowercase();
    if RESERVED_WORDS.iter().any(|word| lower.contains(word)) {
        return Err(AppError::InvalidInput(
            "display name contains a reserved word".to_string(),
        ));
    }

    Ok(name.to_string())
}

/// Generate a pseudonymous display name such as `Stranger_0427`
pub fn generate_pseudonym() -> String {
    let n: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("Stranger_{:04}", n)
}

/// Validate chat text against the character bound
///
/// Control characters other than newline and tab are stripped; everything else
/// is kept verbatim.
pub fn sanitize_message(text: &str, max_chars: usize) -> Result<String, AppError> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    if cleaned.trim().is_empty() {
        return Err(AppError::MessageEmpty);
    }

    let len = cleaned.chars().count();
    if len > max_chars {
        return Err(AppError::MessageTooLong { len, max: max_chars });
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_trimmed() {
        assert_eq!(validate_display_name("  alice_42 ").unwrap(), "alice_42");
    }

    #[test]
    fn test_display_name_length_bounds() {
        assert!(validate_display_name("a").is_err());
        assert!(validate_display_name("ab").is_ok());
        assert!(validate_display_name(&"a".repeat(15)).is_ok());
        assert!(validate_display_name(&"a".repeat(16)).is_err());
    }

    #[test]
    fn test_display_name_charset() {
        assert!(validate_display_name("bad name").is_err());
        assert!(validate_display_name("émile").is_err());
        assert!(validate_display_name("<b>hi</b>").is_err());
    }

    #[test]
    fn test_display_name_reserved() {
        assert!(matches!(
            validate_display_name("SuperAdmin"),
            Err(AppError::InvalidInput(_))
        ));
        assert!(validate_display_name("chatbot").is_err());
    }

    #[test]
    fn test_generated_pseudonym_is_valid() {
        for _ in 0..20 {
            let name = generate_pseudonym();
            assert!(name.starts_with("Stranger_"));
            assert!(validate_display_name(&name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_message_boundary() {
        let exact = "x".repeat(1000);
        assert_eq!(sanitize_message(&exact, 1000).unwrap(), exact);

        let over = "x".repeat(1001);
        assert!(matches!(
            sanitize_message(&over, 1000),
            Err(AppError::MessageTooLong { len: 1001, max: 1000 })
        ));
    }

    #[test]
    fn test_message_counts_chars_not_bytes() {
        let text = "é".repeat(1000);
        assert!(sanitize_message(&text, 1000).is_ok());
    }

    #[test]
    fn test_message_empty() {
        assert!(matches!(sanitize_message("", 1000), Err(AppError::MessageEmpty)));
        assert!(matches!(sanitize_message(" \n\t ", 1000), Err(AppError::MessageEmpty)));
        assert!(matches!(sanitize_message("\u{0007}", 1000), Err(AppError::MessageEmpty)));
    }

    #[test]
    fn test_message_strips_control_chars() {
        assert_eq!(
            sanitize_message("hi\u{0000} there\nok\u{001b}", 1000).unwrap(),
            "hi there\nok"
        );
        assert_eq!(sanitize_message("  padded  ", 1000).unwrap(), "  padded  ");
    }
}
