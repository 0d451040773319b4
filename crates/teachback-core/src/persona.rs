use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::Role;

const TUTOR_INSTRUCTIONS: &str = "\
You are a REAL teacher explaining the Doppler Effect to a student. Act naturally like a human teacher would:
- Be conversational and friendly, but not overly perfect
- Break concepts into digestible chunks (2-3 paragraphs max per response)
- Sometimes pause to check if the student understands: \"Does that make sense?\", \"Are you following?\", \"Any questions so far?\"
- Use everyday examples and analogies that students can relate to
- If the student seems confused, try explaining it differently
- If they ask questions, answer clearly but don't be overly formal
- Occasionally use casual language like \"So basically...\" or \"Think of it this way...\"
- Don't be a perfect robot - be human-like in your responses
- If the student says \"yes\", \"ready\", \"ok\", \"let's go\", or similar, start teaching the Doppler Effect step by step
- After explaining a concept, naturally check in: \"Make sense?\", \"Have you heard of this before?\", \"Does that help?\"
- Keep responses natural and conversational (3-4 sentences for explanations, 1-2 for questions)

Start teaching the Doppler Effect when the student is ready. Cover:
1. What the Doppler Effect is (in simple terms)
2. How it works with sound waves (with examples)
3. How it works with light waves (briefly)
4. Real-world examples they might have experienced

Remember: Be a REAL teacher, not a perfect AI. Be natural, conversational, and human-like!";

const STUDENT_INSTRUCTIONS: &str = "\
You are a STUDENT learning about the Doppler Effect. A teacher is explaining it to you.
Your role is to act like a REAL STUDENT who:
- Sometimes doesn't understand explanations
- Questions things that seem unclear or incorrect
- Gets confused when explanations are wrong or incomplete
- Asks for clarification when something doesn't make sense
- Shows uncertainty when the teacher makes mistakes

IMPORTANT BEHAVIOR RULES:
1. If the teacher's explanation is CORRECT and clear: Show understanding with responses like \"Oh, I see!\", \"That makes sense\", \"Got it, thanks!\", or ask a follow-up question to show engagement.

2. If the teacher's explanation is INCORRECT, unclear, or has mistakes:
   - DO NOT correct them or provide the right answer
   - Instead, act confused or question it with responses like:
     * \"Hmm, I don't think that's quite right...\"
     * \"I'm not sure I understand that part\"
     * \"Wait, that doesn't make sense to me\"
     * \"I'm confused about that\"
     * \"That seems off to me\"
     * \"I don't think that's correct\"
   - Ask them to explain again or clarify

3. Keep responses SHORT (1-2 sentences max)
4. Be natural and conversational
5. Show genuine confusion when explanations are wrong - don't pretend to understand
6. Never give away the correct answer - just express confusion or doubt

Now respond as a student would:";

const TUTOR_OPENING: &str = "Hey! I'm going to teach you about the Doppler Effect today. \
It's a pretty cool physics concept that you've probably experienced in real life. \
Ready to learn? Just say 'yes' or 'ready' when you want to start, or feel free to ask me anything!";

const STUDENT_OPENING: &str = "Hi! I've never heard of the Doppler Effect before. \
Can you teach me about it? I'm a bit confused about physics concepts, \
so please explain it in a way that's easy to understand.";

pub const CONFUSED_FALLBACKS: [&str; 3] = [
    "Hmm, I'm not sure I understand that part. Can you explain it differently?",
    "I'm a bit confused. Could you clarify?",
    "That doesn't quite make sense to me. Can you go over that again?",
];

/// Instruction template that shapes the simulated side of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// The AI teaches; the participant is the student.
    Tutor,
    /// The AI plays a confused student; the participant teaches.
    ConfusedStudent,
}

impl Persona {
    pub fn instructions(self) -> &'static str {
        match self {
            Self::Tutor => TUTOR_INSTRUCTIONS,
            Self::ConfusedStudent => STUDENT_INSTRUCTIONS,
        }
    }

    /// Role played by the completion service.
    pub fn ai_role(self) -> Role {
        match self {
            Self::Tutor => Role::Tutor,
            Self::ConfusedStudent => Role::Student,
        }
    }

    /// Role played by the participant.
    pub fn participant_role(self) -> Role {
        self.ai_role().counterpart()
    }

    /// Prompt label for a role. The participant is addressed as "Teacher" when
    /// they do the teaching.
    pub fn label(self, role: Role) -> &'static str {
        match (self, role) {
            (Self::Tutor, Role::Tutor) => "Tutor",
            (Self::ConfusedStudent, Role::Tutor) => "Teacher",
            (_, Role::Student) => "Student",
        }
    }

    /// First message the AI side sends when the stage opens.
    pub fn opening_message(self) -> &'static str {
        match self {
            Self::Tutor => TUTOR_OPENING,
            Self::ConfusedStudent => STUDENT_OPENING,
        }
    }

    /// Used when the provider answered but carried no text.
    pub fn empty_reply(self) -> &'static str {
        match self {
            Self::Tutor => {
                "I'm sorry, I couldn't process that. Could you try rephrasing your question?"
            }
            Self::ConfusedStudent => "Thank you for your explanation!",
        }
    }

    /// Used when the provider call failed outright.
    pub fn error_fallback<R: Rng + ?Sized>(self, error: &str, rng: &mut R) -> String {
        match self {
            Self::Tutor => format!(
                "I apologize, but I'm having trouble responding: {error}. Please try again."
            ),
            Self::ConfusedStudent => {
                CONFUSED_FALLBACKS[rng.gen_range(0..CONFUSED_FALLBACKS.len())].to_string()
            }
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tutor => write!(f, "tutor"),
            Self::ConfusedStudent => write!(f, "confused_student"),
        }
    }
}

/// Canned openers offered before the teaching conversation gets going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickAction {
    Ready,
    WhatIsIt,
    Example,
}

impl QuickAction {
    pub const ALL: [QuickAction; 3] = [Self::Ready, Self::WhatIsIt, Self::Example];

    pub fn prompt(self) -> &'static str {
        match self {
            Self::Ready => "Yes, I'm ready!",
            Self::WhatIsIt => "What is the Doppler Effect?",
            Self::Example => "Can you give me an example?",
        }
    }

    pub fn fallback(self) -> &'static str {
        match self {
            Self::Ready => "I'm ready to teach! Let's start with what the Doppler Effect is.",
            Self::WhatIsIt => "Great question! Let me explain...",
            Self::Example => "Sure! Here's a great example...",
        }
    }
}

impl std::str::FromStr for QuickAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ready" => Ok(Self::Ready),
            "what" | "what_is_it" => Ok(Self::WhatIsIt),
            "example" => Ok(Self::Example),
            _ => Err(format!("invalid quick action: {s}")),
        }
    }
}
