//! Rule evaluation.
//!
//! A pure function from (message, ordered rules) to a decision. The
//! fetcher uses it on the live path and the reapply maintenance
//! operation re-runs it over stored messages; both must agree, so
//! nothing here touches the store or the clock.

use crate::adapters::sqlite::rules::MailRule;

/// What the rules decided for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Labels to add, insertion order, no duplicates.
    pub add_labels: Vec<String>,
    /// Effective Telegram opt-in. Starts at the account default and
    /// follows the last matching rule; the account-level veto is applied
    /// by the delivery layer, not here.
    pub push_telegram: bool,
    pub mark_read: bool,
}

/// The message fields rules can see.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub account_id: i64,
    pub sender: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
}

/// Case-insensitive substring test; an empty pattern doesn't constrain.
fn pattern_match(text: &str, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return true;
    }
    text.to_lowercase().contains(&pattern.to_lowercase())
}

fn rule_matches(rule: &MailRule, input: &RuleInput) -> bool {
    if let Some(account_id) = rule.account_id {
        if account_id != input.account_id {
            return false;
        }
    }
    pattern_match(input.sender, &rule.sender_pattern)
        && pattern_match(input.subject, &rule.subject_pattern)
        && pattern_match(input.body, &rule.body_pattern)
}

/// Evaluate all rules against one message.
///
/// Rules are applied in `(rule_order ASC, id ASC)` order regardless of
/// input order. Every matching rule contributes: labels accumulate,
/// `mark_read` is sticky, and `push_telegram` takes the last matching
/// rule's value.
pub fn evaluate(input: &RuleInput, default_push_telegram: bool, rules: &[MailRule]) -> Decision {
    let mut ordered: Vec<&MailRule> = rules.iter().collect();
    ordered.sort_by_key(|r| (r.rule_order, r.id));

    let mut decision = Decision {
        add_labels: Vec::new(),
        push_telegram: default_push_telegram,
        mark_read: false,
    };

    for rule in ordered {
        if !rule_matches(rule, input) {
            continue;
        }
        for label in &rule.add_labels {
            let label = label.trim();
            if !label.is_empty() && !decision.add_labels.iter().any(|l| l == label) {
                decision.add_labels.push(label.to_string());
            }
        }
        decision.push_telegram = rule.push_telegram;
        decision.mark_read = decision.mark_read || rule.mark_read;
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, order: i64) -> MailRule {
        MailRule {
            id,
            name: format!("r{}", id),
            rule_order: order,
            account_id: None,
            sender_pattern: String::new(),
            subject_pattern: String::new(),
            body_pattern: String::new(),
            add_labels: Vec::new(),
            push_telegram: true,
            mark_read: false,
        }
    }

    fn input(account_id: i64) -> RuleInput<'static> {
        RuleInput {
            account_id,
            sender: "ops@example.com",
            subject: "Alert: disk",
            body: "disk almost full on host-1",
        }
    }

    #[test]
    fn empty_rule_list_returns_initial_decision() {
        let decision = evaluate(&input(1), true, &[]);
        assert_eq!(
            decision,
            Decision {
                add_labels: vec![],
                push_telegram: true,
                mark_read: false,
            }
        );
        assert!(!evaluate(&input(1), false, &[]).push_telegram);
    }

    #[test]
    fn all_matching_rules_contribute_and_push_follows_last_writer() {
        // R1 (order 0): label P1, push = true.
        // R2 (order 1): label P2, push = false.
        let mut r1 = rule(1, 0);
        r1.subject_pattern = "alert".to_string();
        r1.add_labels = vec!["P1".to_string()];
        r1.push_telegram = true;

        let mut r2 = rule(2, 1);
        r2.subject_pattern = "alert".to_string();
        r2.add_labels = vec!["P2".to_string()];
        r2.push_telegram = false;

        let decision = evaluate(&input(1), true, &[r1, r2]);
        assert_eq!(decision.add_labels, vec!["P1", "P2"]);
        assert!(!decision.push_telegram);
    }

    #[test]
    fn matching_is_case_insensitive_substring() {
        let mut r = rule(1, 0);
        r.subject_pattern = "ALERT".to_string();
        r.add_labels = vec!["hit".to_string()];
        let decision = evaluate(&input(1), true, &[r]);
        assert_eq!(decision.add_labels, vec!["hit"]);
    }

    #[test]
    fn all_non_empty_predicates_must_match() {
        let mut r = rule(1, 0);
        r.subject_pattern = "alert".to_string();
        r.sender_pattern = "nobody@else.com".to_string();
        r.add_labels = vec!["hit".to_string()];
        let decision = evaluate(&input(1), true, &[r]);
        assert!(decision.add_labels.is_empty());
    }

    #[test]
    fn account_scoped_rule_skips_other_accounts() {
        let mut r = rule(1, 0);
        r.account_id = Some(7);
        r.add_labels = vec!["scoped".to_string()];

        assert!(evaluate(&input(1), true, std::slice::from_ref(&r))
            .add_labels
            .is_empty());
        assert_eq!(
            evaluate(&input(7), true, &[r]).add_labels,
            vec!["scoped"]
        );
    }

    #[test]
    fn mark_read_is_sticky_across_rules() {
        let mut r1 = rule(1, 0);
        r1.mark_read = true;
        let r2 = rule(2, 1);

        let decision = evaluate(&input(1), true, &[r1, r2]);
        assert!(decision.mark_read);
    }

    #[test]
    fn evaluation_order_ignores_input_order() {
        let mut r1 = rule(1, 0);
        r1.push_telegram = true;
        let mut r2 = rule(2, 1);
        r2.push_telegram = false;

        let forward = evaluate(&input(1), true, &[r1.clone(), r2.clone()]);
        let reversed = evaluate(&input(1), true, &[r2, r1]);
        assert_eq!(forward, reversed);
        assert!(!forward.push_telegram);
    }

    #[test]
    fn equal_order_ties_break_by_id() {
        let mut a = rule(1, 0);
        a.push_telegram = false;
        let mut b = rule(2, 0);
        b.push_telegram = true;

        // id 2 evaluates after id 1, so its value wins.
        let decision = evaluate(&input(1), false, &[b.clone(), a.clone()]);
        assert!(decision.push_telegram);
    }

    #[test]
    fn duplicate_labels_collapse() {
        let mut r1 = rule(1, 0);
        r1.add_labels = vec!["P1".to_string(), " P1 ".to_string()];
        let mut r2 = rule(2, 1);
        r2.add_labels = vec!["P1".to_string(), "P2".to_string()];

        let decision = evaluate(&input(1), true, &[r1, r2]);
        assert_eq!(decision.add_labels, vec!["P1", "P2"]);
    }

    #[test]
    fn deterministic_repeat_evaluation() {
        let mut r = rule(1, 0);
        r.body_pattern = "disk".to_string();
        r.add_labels = vec!["infra".to_string()];
        let rules = vec![r];

        let first = evaluate(&input(1), true, &rules);
        let second = evaluate(&input(1), true, &rules);
        assert_eq!(first, second);
    }
}
