// src/core/router/messages.rs

use serde::Deserialize;

/// Player-facing texts used by the router. Placeholders: `{portal}`, `{server}`,
/// `{portals}`, `{reason}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Messages {
    pub no_selection_made: String,
    pub portal_created: String,
    pub portal_updated: String,
    pub portal_deleted: String,
    pub portal_does_not_exist: String,
    pub no_portals: String,
    pub portal_list_entry: String,
    pub teleport_failed: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            no_selection_made: "You need to make a selection first.".into(),
            portal_created: "Portal {portal} created.".into(),
            portal_updated: "Portal {portal} updated.".into(),
            portal_deleted: "Portal {portal} deleted.".into(),
            portal_does_not_exist: "Portal {portal} does not exist.".into(),
            no_portals: "There are no portals.".into(),
            portal_list_entry: "{server}: {portals}".into(),
            teleport_failed: "Could not teleport you: {reason}".into(),
        }
    }
}

/// Substitutes `{name}` placeholders in `template`.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |text, (name, value)| {
            text.replace(&format!("{{{name}}}"), value)
        })
}
