//! `{{key}}` placeholder rendering for message bodies and subjects.
//!
//! A key is any text without braces; whitespace just inside the braces is
//! ignored, so `{{ first_name }}` and `{{first_name}}` are the same key.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use beacon_common::types::Recipient;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder pattern is valid")
});

/// Replace every `{{key}}` with its value from `vars`.
///
/// Placeholders without a matching key are left verbatim.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Variables available to one recipient's message.
///
/// Job-level variables come first and are overridden by the recipient's name
/// parts, which are in turn overridden by the recipient's own variables.
pub fn merge_variables(
    job_vars: &HashMap<String, String>,
    recipient: &Recipient,
) -> HashMap<String, String> {
    let mut vars = job_vars.clone();
    vars.insert("first_name".to_string(), recipient.first_name.clone());
    vars.insert("last_name".to_string(), recipient.last_name.clone());
    vars.insert("full_name".to_string(), recipient.full_name());
    vars.extend(
        recipient
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_substitutes_known_keys() {
        let out = render(
            "Dear {{first_name}}, fees due {{ due_date }}.",
            &vars(&[("first_name", "Ada"), ("due_date", "1 May")]),
        );
        assert_eq!(out, "Dear Ada, fees due 1 May.");
    }

    #[test]
    fn test_render_leaves_unmatched_verbatim() {
        let out = render("Hi {{first_name}} {{unknown}}", &vars(&[("first_name", "Ada")]));
        assert_eq!(out, "Hi Ada {{unknown}}");
    }

    #[test]
    fn test_render_keys_with_spaces_and_symbols() {
        let out = render(
            "Owed: {{fee amount}} ({{ fee amount }}), ref {{inv#2024/07}}, {{}}",
            &vars(&[("fee amount", "$120"), ("inv#2024/07", "A-17")]),
        );
        assert_eq!(out, "Owed: $120 ($120), ref A-17, {{}}");
    }

    #[test]
    fn test_render_repeated_placeholder() {
        let out = render("{{x}}-{{x}}-{x}", &vars(&[("x", "1")]));
        assert_eq!(out, "1-1-{x}");
    }

    #[test]
    fn test_merge_precedence() {
        let recipient = Recipient {
            id: 7,
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: None,
            phone: None,
            variables: vars(&[("balance", "120.00")]),
        };
        let job_vars = vars(&[("school", "Hillside"), ("first_name", "Parent"), ("balance", "0")]);

        let merged = merge_variables(&job_vars, &recipient);
        assert_eq!(merged["school"], "Hillside");
        assert_eq!(merged["first_name"], "Ada");
        assert_eq!(merged["full_name"], "Ada Lovelace");
        assert_eq!(merged["balance"], "120.00");
    }
}
