use crate::data::types::Question;
use crate::instantiators::{ConsequenceFlavour, InstantiatorKind};

pub const GENERATION_PREFACE: &str = "You write forecasting questions. Every question must be \
answerable with yes or no on its resolution date, and its body must state precise resolution \
criteria. Keep the style of the input questions.";

pub const VERIFICATION_PREFACE: &str = "You audit forecasting questions. Judge only whether the \
logical relation described holds between the questions as written, including their resolution \
criteria and dates. Be strict.";

fn describe(label: &str, q: &Question) -> String {
    format!(
        "{label}:\nTitle: {}\nBody: {}\nResolution date: {}",
        q.title,
        q.body,
        q.resolution_date.format("%Y-%m-%d")
    )
}

fn describe_inputs(inputs: &[&Question]) -> String {
    let labels = ["P", "Q", "R"];
    inputs
        .iter()
        .enumerate()
        .map(|(i, q)| describe(labels.get(i).copied().unwrap_or("X"), q))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn flavour_instruction(flavour: ConsequenceFlavour) -> &'static str {
    match flavour {
        ConsequenceFlavour::Quantity => {
            "Relax a numeric threshold in P (for example 'more than 100' becomes 'more than 50') \
             so the new question resolves yes whenever P does."
        }
        ConsequenceFlavour::Time => {
            "Extend the time window of P (for example 'by June' becomes 'by December'). You may \
             set a later resolution_date; never an earlier one."
        }
        ConsequenceFlavour::Misc => {
            "Write any broader question that must resolve yes whenever P resolves yes, for \
             example by widening a category or dropping a condition."
        }
    }
}

/// Task statement for generating the derived question.
pub fn generation_prompt(
    kind: InstantiatorKind,
    inputs: &[&Question],
    flavour: Option<ConsequenceFlavour>,
    feedback: Option<&str>,
) -> String {
    let task = match kind {
        InstantiatorKind::Trivial => "Repeat P unchanged.".to_string(),
        InstantiatorKind::Neg => {
            "Write the negation of P: a question that resolves yes exactly when P resolves no.".to_string()
        }
        InstantiatorKind::And => {
            "Write the conjunction of P and Q: a question that resolves yes exactly when both \
             P and Q resolve yes."
                .to_string()
        }
        InstantiatorKind::Or => {
            "Write the disjunction of P and Q: a question that resolves yes exactly when at \
             least one of P and Q resolves yes."
                .to_string()
        }
        InstantiatorKind::Conditional => {
            "Write the conditional question 'Given that P resolves yes, will Q resolve yes?'. \
             State in the body that the question resolves N/A if P resolves no."
                .to_string()
        }
        InstantiatorKind::Paraphrase => {
            "Rephrase P with different wording but identical resolution criteria, so it \
             resolves yes exactly when P does."
                .to_string()
        }
        InstantiatorKind::Consequence => {
            let flavour = flavour.unwrap_or(ConsequenceFlavour::Misc);
            format!(
                "Write a strictly weaker question implied by P. {}",
                flavour_instruction(flavour)
            )
        }
        InstantiatorKind::Related => {
            "Write a different question about an event related to P, with the same resolution \
             date, whose outcome is neither implied nor excluded by P."
                .to_string()
        }
    };

    let mut prompt = format!("{}\n\n{}", describe_inputs(inputs), task);
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\n\nA previous attempt was rejected for this reason:\n{}\nAvoid the same problem.",
            feedback
        ));
    }
    prompt
}

/// Statement of the relation the verifier must confirm.
pub fn verification_prompt(kind: InstantiatorKind, inputs: &[&Question], derived: &Question) -> String {
    let relation = match kind {
        InstantiatorKind::Trivial => "NEW is identical to P.",
        InstantiatorKind::Neg => "NEW resolves yes if and only if P resolves no.",
        InstantiatorKind::And => "NEW resolves yes if and only if both P and Q resolve yes.",
        InstantiatorKind::Or => "NEW resolves yes if and only if at least one of P and Q resolves yes.",
        InstantiatorKind::Conditional => {
            "NEW asks whether Q resolves yes given that P resolves yes, and is void when P resolves no."
        }
        InstantiatorKind::Paraphrase => "NEW resolves yes if and only if P resolves yes.",
        InstantiatorKind::Consequence => {
            "Whenever P resolves yes, NEW must also resolve yes, and NEW is not equivalent to P."
        }
        InstantiatorKind::Related => "NEW concerns an event related to P and is not logically determined by P.",
    };
    format!(
        "{}\n\n{}\n\nClaim: {}\n\nReturn valid=true only if the claim holds, and a score in [0, 1] \
         for your confidence that it holds.",
        describe_inputs(inputs),
        describe("NEW", derived),
        relation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_prompt_lists_inputs_and_feedback() {
        let date = Utc.with_ymd_and_hms(2027, 3, 1, 0, 0, 0).unwrap();
        let p = Question::binary("Will A win?", "Resolves yes if A wins.", date);
        let q = Question::binary("Will B win?", "Resolves yes if B wins.", date);
        let prompt = generation_prompt(InstantiatorKind::And, &[&p, &q], None, Some("too vague"));
        assert!(prompt.contains("Will A win?"));
        assert!(prompt.contains("Will B win?"));
        assert!(prompt.contains("2027-03-01"));
        assert!(prompt.contains("too vague"));

        let prompt = generation_prompt(
            InstantiatorKind::Consequence,
            &[&p],
            Some(ConsequenceFlavour::Time),
            None,
        );
        assert!(prompt.contains("time window"));
    }
}
