//! Quiz runs over a deck, producing a [`SessionResult`] on completion.

use std::time::Instant;

use rand::seq::SliceRandom;

use crate::models::{now_millis, Deck, SessionResult, StimulusCard};

pub struct QuizSession {
    deck_id: String,
    cards: Vec<StimulusCard>,
    position: usize,
    correct: u32,
    incorrect: u32,
    started: Instant,
}

impl QuizSession {
    pub fn start(deck: &Deck, shuffle: bool) -> Self {
        let mut cards = deck.cards.clone();
        if shuffle {
            cards.shuffle(&mut rand::thread_rng());
        }
        Self {
            deck_id: deck.id.clone(),
            cards,
            position: 0,
            correct: 0,
            incorrect: 0,
            started: Instant::now(),
        }
    }

    /// Card awaiting an answer, or `None` once every card has been answered.
    pub fn current(&self) -> Option<&StimulusCard> {
        self.cards.get(self.position)
    }

    /// Record the answer for the current card and advance. No-op when done.
    pub fn answer(&mut self, correct: bool) {
        if self.is_finished() {
            return;
        }
        if correct {
            self.correct += 1;
        } else {
            self.incorrect += 1;
        }
        self.position += 1;
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.cards.len()
    }

    /// (answered, total)
    pub fn progress(&self) -> (usize, usize) {
        (self.position, self.cards.len())
    }

    /// Close the run. May be called early; unanswered cards count toward
    /// neither correct nor incorrect.
    pub fn finish(self) -> SessionResult {
        SessionResult {
            deck_id: self.deck_id,
            date: now_millis(),
            total_cards: self.cards.len() as u32,
            correct_count: self.correct,
            incorrect_count: self.incorrect,
            duration_seconds: self.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaType;

    fn deck_of(n: usize) -> Deck {
        let mut deck = Deck::new("Body parts", "");
        for i in 0..n {
            deck.cards
                .push(StimulusCard::new(&format!("word{i}"), "data:x", MediaType::Image));
        }
        deck
    }

    #[test]
    fn test_full_run_counts_answers() {
        let deck = deck_of(3);
        let mut quiz = QuizSession::start(&deck, false);

        assert_eq!(quiz.current().unwrap().label, "word0");
        quiz.answer(true);
        quiz.answer(false);
        quiz.answer(true);
        assert!(quiz.is_finished());
        assert!(quiz.current().is_none());
        quiz.answer(true);

        let result = quiz.finish();
        assert_eq!(result.deck_id, deck.id);
        assert_eq!(result.total_cards, 3);
        assert_eq!(result.correct_count, 2);
        assert_eq!(result.incorrect_count, 1);
    }

    #[test]
    fn test_early_finish() {
        let mut quiz = QuizSession::start(&deck_of(4), false);
        quiz.answer(false);
        assert_eq!(quiz.progress(), (1, 4));

        let result = quiz.finish();
        assert_eq!(result.total_cards, 4);
        assert_eq!(result.correct_count + result.incorrect_count, 1);
    }

    #[test]
    fn test_shuffle_keeps_every_card() {
        let deck = deck_of(10);
        let mut quiz = QuizSession::start(&deck, true);
        let mut labels = Vec::new();
        while let Some(card) = quiz.current() {
            labels.push(card.label.clone());
            quiz.answer(true);
        }
        labels.sort();
        let mut expected: Vec<String> = deck.cards.iter().map(|c| c.label.clone()).collect();
        expected.sort();
        assert_eq!(labels, expected);
    }

    #[test]
    fn test_empty_deck_is_finished_immediately() {
        let quiz = QuizSession::start(&deck_of(0), true);
        assert!(quiz.is_finished());
        assert_eq!(quiz.finish().total_cards, 0);
    }
}
