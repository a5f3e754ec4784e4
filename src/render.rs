//! Rendering of a campaign template for one recipient.

use crate::model::Recipient;

/// Turns a campaign template into the content sent to one recipient.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, recipient: &Recipient) -> String;
}

/// Replaces `{{field}}` placeholders with recipient fields.
///
/// Known fields are `firstName`, `lastName`, `name`, `phone` and `address`;
/// any other name is looked up in the recipient's custom fields.
/// Unknown placeholders render as empty text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    fn lookup(recipient: &Recipient, field: &str) -> String {
        match field {
            "firstName" => recipient.first_name.clone().unwrap_or_default(),
            "lastName" => recipient.last_name.clone().unwrap_or_default(),
            "name" => recipient.full_name(),
            "phone" | "address" => recipient.address.clone(),
            other => recipient
                .custom_fields
                .get(other)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, recipient: &Recipient) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    out.push_str(&Self::lookup(recipient, after[..end].trim()));
                    rest = &after[end + 2..];
                }
                None => {
                    // unterminated, keep verbatim
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_known_and_custom_fields() {
        let mut recipient = Recipient::new("+15550100").with_name("Ada", "Lovelace");
        recipient
            .custom_fields
            .insert("city".to_string(), "London".to_string());

        let rendered = PlaceholderRenderer.render(
            "Hi {{firstName}} ({{ name }}) from {{city}}, reply to {{phone}}",
            &recipient,
        );
        assert_eq!(
            rendered,
            "Hi Ada (Ada Lovelace) from London, reply to +15550100"
        );
    }

    #[test]
    fn test_render_missing_and_unterminated() {
        let recipient = Recipient::new("+15550100");
        assert_eq!(
            PlaceholderRenderer.render("Hi {{firstName}}!", &recipient),
            "Hi !"
        );
        assert_eq!(
            PlaceholderRenderer.render("Hi {{firstName", &recipient),
            "Hi {{firstName"
        );
    }
}
