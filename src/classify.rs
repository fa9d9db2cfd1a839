//! Conversation-completion detection.
//!
//! A heuristic decides that the pedagogical activity reached a natural end
//! without an explicit submit action. The default implementation is a curated
//! phrase-marker match; the trait leaves room for a model-based classifier
//! later, so the check stays pluggable and cheap to call after every tutor
//! turn (no extra model round-trip).

use crate::util::normalize_for_match;

/// Decides whether an assistant turn signals that the activity is complete.
/// Synchronous on purpose: detection runs inline after each finished stream.
pub trait CompletionClassifier: Send + Sync {
    fn is_complete(&self, assistant_text: &str) -> bool;
}

/// Case-insensitive containment over curated markers in the two detection
/// languages. False negatives leave the learner able to keep chatting; false
/// positives would prematurely unlock the finish action, so markers are kept
/// specific rather than broad.
pub struct PhraseMarkerClassifier {
    markers: Vec<&'static str>,
}

const MARKERS_EN: [&str; 6] = [
    "we are done",
    "we're done",
    "this concludes our session",
    "you may finish now",
    "we have completed this assignment",
    "feel free to submit your work",
];

const MARKERS_ES: [&str; 5] = [
    "hemos terminado",
    "terminamos por hoy",
    "esto concluye nuestra sesión",
    "puedes finalizar ahora",
    "ya completamos esta tarea",
];

impl PhraseMarkerClassifier {
    pub fn new() -> Self {
        let mut markers = Vec::with_capacity(MARKERS_EN.len() + MARKERS_ES.len());
        markers.extend(MARKERS_EN);
        markers.extend(MARKERS_ES);
        Self { markers }
    }
}

impl Default for PhraseMarkerClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionClassifier for PhraseMarkerClassifier {
    fn is_complete(&self, assistant_text: &str) -> bool {
        let haystack = normalize_for_match(assistant_text);
        self.markers.iter().any(|m| haystack.contains(m))
    }
}
