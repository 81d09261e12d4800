//! Session log of marked regions of interest

use std::fmt;

use chrono::{DateTime, Local};

/// Comment used when the operator leaves the note empty
pub const DEFAULT_COMMENT: &str = "Auffälligkeit";

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// 1-based, in creation order
    pub index: u32,
    pub image_x: u32,
    pub image_y: u32,
    pub comment_text: String,
    pub created_at: DateTime<Local>,
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} – {}",
            self.index,
            self.created_at.format("%Y.%m.%d %H:%M"),
            self.comment_text
        )
    }
}

/// Append-only; entries are never edited or removed
#[derive(Debug, Default)]
pub struct AnnotationLog {
    entries: Vec<Annotation>,
}

impl AnnotationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, image_x: u32, image_y: u32, comment: &str) -> &Annotation {
        self.mark_at(image_x, image_y, comment, Local::now())
    }

    pub fn mark_at(
        &mut self,
        image_x: u32,
        image_y: u32,
        comment: &str,
        created_at: DateTime<Local>,
    ) -> &Annotation {
        let comment = comment.trim();
        let annotation = Annotation {
            index: self.entries.len() as u32 + 1,
            image_x,
            image_y,
            comment_text: if comment.is_empty() {
                DEFAULT_COMMENT.to_string()
            } else {
                comment.to_string()
            },
            created_at,
        };
        self.entries.push(annotation);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[Annotation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One display line per annotation, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }
}
