use crate::types::{IssuedAt, Operation, Question};
use rand::seq::IndexedRandom;
use rand::Rng;

/// Build a question for one of `operations` (uniform choice)
///
/// Every operator yields an exact, non-negative integer answer:
/// - add: both operands in [1,99] with a sum of at most 100
/// - subtract: minuend in [10,99], subtrahend in [10,minuend]
/// - multiply: factors in [3,9], widened to [1,10] with `wide_multiply_percent` chance
/// - divide: divisor and quotient in [1,10], dividend = divisor * quotient
pub fn generate<R: Rng>(
    rng: &mut R,
    operations: &[Operation],
    issued_at: IssuedAt,
    wide_multiply_percent: u32,
) -> Question {
    let op = operations.choose(rng).copied().unwrap_or(Operation::Add);

    let (a, b) = match op {
        Operation::Add => {
            let a = rng.random_range(1..=99);
            let b = rng.random_range(1..=100 - a);
            (a, b)
        }
        Operation::Subtract => {
            let a = rng.random_range(10..=99);
            let b = rng.random_range(10..=a);
            (a, b)
        }
        Operation::Multiply => {
            let wide = rng.random_ratio(wide_multiply_percent.min(100), 100);
            let (low, high) = if wide { (1, 10) } else { (3, 9) };
            (rng.random_range(low..=high), rng.random_range(low..=high))
        }
        Operation::Divide => {
            let divisor = rng.random_range(1..=10);
            let quotient = rng.random_range(1..=10);
            (divisor * quotient, divisor)
        }
    };

    Question {
        a,
        b,
        op,
        issued_at,
    }
}

/// Outcome of checking the current input against the active question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Fewer digits than the correct answer; keep typing
    Incomplete,
    Correct,
    /// Wrong value (or not a number); the input should be cleared
    Wrong,
}

fn digit_count(value: u32) -> usize {
    value.to_string().len()
}

/// Progressive match: input is only judged once it has as many digits as the
/// correct answer, so typing "4" on the way to "42" is not a wrong answer.
pub fn evaluate(question: &Question, raw: &str) -> Evaluation {
    let input = raw.trim();
    if input.is_empty() {
        return Evaluation::Incomplete;
    }
    if !input.chars().all(|c| c.is_ascii_digit()) {
        return Evaluation::Wrong;
    }

    let expected = question.answer();
    if input.len() < digit_count(expected) {
        return Evaluation::Incomplete;
    }

    match input.parse::<u64>() {
        Ok(value) if value == u64::from(expected) => Evaluation::Correct,
        _ => Evaluation::Wrong,
    }
}
