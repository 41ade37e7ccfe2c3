use crate::capacity::SequenceScope;
use crate::error::SabhaError;
use crate::store::RegistryStore;

/// Abbreviate an event name into a chest-number prefix.
///
/// Parentheses are stripped and the first letter of each of the first two
/// words is uppercased, e.g. "Cartoon Drawing (All Styles)" -> "CD".
///
/// The prefix is cosmetic and not collision-free: "Cartoon Drawing" and
/// "Classical Dance" both abbreviate to "CD". Chest numbers are unique only
/// within one event, because each event draws from its own sequence scope;
/// two events sharing a prefix can issue the same chest-number string.
pub fn event_code(event_name: &str) -> String {
    event_name
        .replace(['(', ')'], "")
        .split_whitespace()
        .take(2)
        .filter_map(|word| word.chars().next())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// Render a structured chest number from its coordinates.
pub fn format_chest_number(event_code: &str, unit_code: Option<&str>, sequence: u64) -> String {
    match unit_code {
        Some(unit) => format!("{event_code}-{unit}-{sequence:03}"),
        None => format!("{event_code}-{sequence:03}"),
    }
}

/// Reserve the next chest number within `scope`.
///
/// The sequence is drawn through the store's atomic counter, so two
/// concurrent generations in the same scope can never observe the same
/// value. Callers that already hold a chest number (a member entering a
/// second event, a second batch joining an existing team) must reuse it
/// instead of calling this again.
pub async fn next_chest_number(
    store: &dyn RegistryStore,
    event_code: &str,
    unit_code: Option<&str>,
    scope: &SequenceScope,
) -> Result<String, SabhaError> {
    let sequence = store.next_sequence(scope).await?;
    Ok(format_chest_number(event_code, unit_code, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_code_takes_first_two_words() {
        assert_eq!(event_code("Cartoon Drawing"), "CD");
        assert_eq!(event_code("Group Song (Malayalam)"), "GS");
        assert_eq!(event_code("Quiz"), "Q");
        assert_eq!(event_code("(solo) violin recital"), "SV");
    }

    #[test]
    fn distinct_events_can_share_a_prefix() {
        // Uniqueness comes from the per-event sequence, not the prefix.
        assert_eq!(event_code("Cartoon Drawing"), event_code("Classical Dance"));
    }

    #[test]
    fn chest_number_is_zero_padded() {
        assert_eq!(format_chest_number("CD", None, 7), "CD-007");
        assert_eq!(format_chest_number("GS", Some("TVM"), 12), "GS-TVM-012");
        assert_eq!(format_chest_number("CD", None, 1024), "CD-1024");
    }
}
