//! Writing helpers backed by the generation service: summaries, keyword tags and
//! structured note templates.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::AppError;
use crate::generation::ChatBackend;
use crate::models::{
    ChatMessage, KeywordsResponse, NoteUpdate, SummaryResponse, TemplateResponse,
};
use crate::notes::NoteService;

const KEYWORD_COUNT: usize = 5;
const DEFAULT_TEMPLATE: &str = "# New Note\n\n";

// list markers, quotes and trailing periods around a model-produced term
static TERM_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[\s"'`*•\-]+|[\s"'`*.]+$"#).unwrap());

fn summary_prompt(content: &str) -> String {
    format!(
        "Please summarize the following note concisely:\n\n{}",
        content
    )
}

fn keywords_prompt(content: &str) -> String {
    format!(
        "Extract exactly 5 meaningful keywords or key phrases from the following note. \n\
These should be the most relevant tags that represent the main topics and concepts in the content.\n\
Format your response as a comma-separated list of single words or short phrases.\n\
Make sure your response ENDS with these 5 keywords/phrases separated by commas.\n\
\n\
Note content:\n\
{}",
        content
    )
}

/// The model is asked to end its reply with the list, so only the last terms count.
pub fn parse_keywords(reply: &str) -> Vec<String> {
    let terms: Vec<String> = reply
        .split(',')
        .map(|term| TERM_NOISE.replace_all(term, "").into_owned())
        .filter(|term| !term.is_empty())
        .collect();
    let skip = terms.len().saturating_sub(KEYWORD_COUNT);
    terms.into_iter().skip(skip).collect()
}

/// Built-in skeleton for `note_type`, or a bare heading for unknown types.
pub fn template_for(note_type: &str) -> &'static str {
    match note_type.trim().to_lowercase().as_str() {
        "list" => "# List Title\n\n- Item 1\n- Item 2\n- Item 3\n\n## Notes\n\n",
        "meeting" => "# Meeting: [Title]\n\nDate: [Date]\nAttendees: [Names]\n\n## Agenda\n\n1. \n2. \n\n## Notes\n\n\n## Action Items\n\n- [ ] Task 1\n- [ ] Task 2\n",
        "letter" => "# Letter\n\n[Your Address]\n[City, State ZIP]\n[Date]\n\n[Recipient Name]\n[Recipient Address]\n[City, State ZIP]\n\nDear [Name],\n\n[Body of letter]\n\nSincerely,\n\n[Your Name]\n",
        "journal" => "# Journal Entry\n\nDate: [Date]\n\n## Today's Highlights\n\n\n## Reflection\n\n\n## Tomorrow's Goals\n\n",
        _ => DEFAULT_TEMPLATE,
    }
}

/// `details` when given, otherwise the template's own heading.
fn title_suggestion(template: &str, details: &str) -> String {
    let details = details.trim();
    if !details.is_empty() {
        return details.to_string();
    }
    template
        .lines()
        .next()
        .map(|heading| heading.trim_start_matches('#').trim().to_string())
        .unwrap_or_default()
}

pub struct AssistService {
    notes: Arc<NoteService>,
    chat: Arc<dyn ChatBackend>,
}

impl AssistService {
    pub fn new(notes: Arc<NoteService>, chat: Arc<dyn ChatBackend>) -> Self {
        Self { notes, chat }
    }

    pub async fn summarize(
        &self,
        owner: &str,
        note_id: Uuid,
        max_length: usize,
    ) -> Result<SummaryResponse, AppError> {
        let note = self.notes.get_note(owner, note_id).await?;
        if note.content.text.trim().is_empty() {
            return Err(AppError::Validation("note has no text to summarize".to_string()));
        }

        let messages = vec![
            ChatMessage::system(format!(
                "Keep the summary under {} words.",
                max_length.max(1)
            )),
            ChatMessage::user(summary_prompt(&note.content.text)),
        ];
        let summary = self.chat.complete(messages).await?;

        Ok(SummaryResponse {
            summary: summary.trim().to_string(),
            note_id,
            title: note.title,
        })
    }

    /// With `apply`, new keywords are merged into the note's tags.
    pub async fn keywords(
        &self,
        owner: &str,
        note_id: Uuid,
        apply: bool,
    ) -> Result<KeywordsResponse, AppError> {
        let note = self.notes.get_note(owner, note_id).await?;
        if note.content.text.trim().is_empty() {
            return Err(AppError::Validation(
                "note has no text to extract keywords from".to_string(),
            ));
        }

        let reply = self
            .chat
            .complete(vec![ChatMessage::user(keywords_prompt(&note.content.text))])
            .await?;
        let keywords = parse_keywords(&reply);

        let tags = if apply && !keywords.is_empty() {
            let merged: Vec<String> = note
                .tags
                .iter()
                .cloned()
                .chain(keywords.iter().cloned())
                .collect();
            let update = NoteUpdate {
                tags: Some(merged),
                ..NoteUpdate::default()
            };
            self.notes.update_note(owner, note_id, update).await?.tags
        } else {
            note.tags
        };

        Ok(KeywordsResponse {
            keywords,
            tags: tags.into_iter().collect(),
        })
    }

    pub fn template(&self, note_type: &str, details: &str) -> TemplateResponse {
        let template = template_for(note_type);
        TemplateResponse {
            template: template.to_string(),
            title_suggestion: title_suggestion(template, details),
        }
    }
}
