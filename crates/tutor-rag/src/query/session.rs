//! Per-session dialog memory. Each session owns its history; nothing is
//! shared process-wide. The rendered window is bounded so prompts stay
//! small regardless of session length.

#[derive(Debug, Clone)]
pub struct DialogTurn {
    pub question: String,
    pub answer: String,
}

#[derive(Debug)]
pub struct ChatSession {
    turns: Vec<DialogTurn>,
    /// Maximum number of rendered messages (a turn renders as two).
    message_limit: usize,
}

impl ChatSession {
    pub fn new(message_limit: usize) -> Self {
        Self {
            turns: Vec::new(),
            message_limit,
        }
    }

    pub fn push(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.turns.push(DialogTurn {
            question: question.into(),
            answer: answer.into(),
        });
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Render the most recent messages as `Student:`/`Teacher:` lines.
    pub fn render_recent(&self) -> String {
        let messages: Vec<String> = self
            .turns
            .iter()
            .flat_map(|turn| {
                [
                    format!("Student: {}", turn.question),
                    format!("Teacher: {}", turn.answer),
                ]
            })
            .collect();

        let start = messages.len().saturating_sub(self.message_limit);
        messages[start..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_student_teacher_lines() {
        let mut session = ChatSession::new(6);
        session.push("What is the miqat?", "A boundary of consecration.");
        let rendered = session.render_recent();
        assert_eq!(
            rendered,
            "Student: What is the miqat?\nTeacher: A boundary of consecration."
        );
    }

    #[test]
    fn window_keeps_only_recent_messages() {
        let mut session = ChatSession::new(4);
        for i in 0..5 {
            session.push(format!("q{i}"), format!("a{i}"));
        }
        let rendered = session.render_recent();
        // 4 messages = the last 2 turns.
        assert!(!rendered.contains("q2"));
        assert!(rendered.contains("q3"));
        assert!(rendered.contains("a4"));
    }

    #[test]
    fn clear_resets_the_session() {
        let mut session = ChatSession::new(6);
        session.push("q", "a");
        session.clear();
        assert!(session.is_empty());
        assert_eq!(session.render_recent(), "");
    }
}
