//! The per-turn prompt packet and its conversion into a [`ChatPayload`].
//!
//! A packet is an ordered list of XML-tagged sections.  Its rendered text is
//! what gets logged and inspected; the payload is what the model receives.

use crate::ChatPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Directive,
    Lore,
    Temporal,
    Proximity,
    Memory,
    History,
    UserInput,
    Trigger,
}

impl Section {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Directive => "system_directive",
            Self::Lore => "lore",
            Self::Temporal => "temporal_data",
            Self::Proximity => "distance_context",
            Self::Memory => "memory_bank",
            Self::History => "chat_history",
            Self::UserInput => "user_input",
            Self::Trigger => "trigger",
        }
    }

    /// Heading used when the section is folded into the system message.
    fn heading(self) -> Option<&'static str> {
        match self {
            Self::Lore => Some("Lore"),
            Self::Temporal => Some("Time"),
            Self::Proximity => Some("Context"),
            Self::Memory => Some("Memories"),
            Self::History => Some("History"),
            Self::Directive | Self::UserInput | Self::Trigger => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    sections: Vec<(Section, String)>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a section.  Blank bodies are skipped so optional blocks leave
    /// no trace in the rendered prompt.
    pub fn push(&mut self, section: Section, body: impl Into<String>) -> &mut Self {
        let body = body.into();
        let body = body.trim();
        if !body.is_empty() {
            self.sections.push((section, body.to_string()));
        }
        self
    }

    pub fn get(&self, section: Section) -> Option<&str> {
        self.sections
            .iter()
            .find(|(s, _)| *s == section)
            .map(|(_, body)| body.as_str())
    }

    pub fn contains(&self, section: Section) -> bool {
        self.get(section).is_some()
    }

    pub fn sections(&self) -> impl Iterator<Item = Section> + '_ {
        self.sections.iter().map(|(s, _)| *s)
    }

    /// Full XML-tagged text, sections in insertion order.
    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|(section, body)| format!("<{tag}>\n{body}\n</{tag}>", tag = section.tag()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Split the packet into system instructions and user-visible content.
    ///
    /// The directive and every context section go into `system`, followed by
    /// a reminder to answer as `agent_name`.  `user` is the raw input plus
    /// the trigger line.
    pub fn to_payload(&self, agent_name: &str) -> ChatPayload {
        let mut system_parts = Vec::new();
        if let Some(directive) = self.get(Section::Directive) {
            system_parts.push(directive.to_string());
        }

        let context: Vec<String> = self
            .sections
            .iter()
            .filter_map(|(section, body)| section.heading().map(|h| format!("{h}:\n{body}")))
            .collect();
        if !context.is_empty() {
            system_parts.push(context.join("\n"));
        }
        system_parts.push(format!("\nRespond as {agent_name}. Start with [{agent_name}]:"));

        let mut user = self.get(Section::UserInput).unwrap_or_default().to_string();
        if let Some(trigger) = self.get(Section::Trigger) {
            user.push_str("\n\n");
            user.push_str(trigger);
        }

        ChatPayload::new(system_parts.join("\n"), user)
    }
}
