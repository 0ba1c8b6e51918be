//! Data exchange between the controlling process and the worker set
//!
//! `push` broadcasts named values into every worker namespace; `pull`
//! gathers named values back. Gathered results are returned ordered by
//! worker rank ascending, whatever order the workers answered in, so
//! callers can correlate entries positionally with the ranks that produced
//! them.

use serde_json::Value;
use std::collections::HashMap;

use crate::backend::EngineValues;
use crate::core::errors::{MusterError, Result};

/// Assemble gathered per-engine replies into a per-name mapping.
///
/// Enforces the rank-ordering guarantee: replies are sorted by rank and the
/// result must cover exactly ranks `0..expected`, each answering every
/// requested name.
pub fn assemble_pull(
    names: &[String],
    mut gathered: Vec<EngineValues>,
    expected: usize,
) -> Result<HashMap<String, Vec<Value>>> {
    if gathered.len() != expected {
        return Err(MusterError::backend(format!(
            "gather answered by {}/{} workers",
            gathered.len(),
            expected
        )));
    }

    gathered.sort_by_key(|ev| ev.rank);
    for (position, ev) in gathered.iter().enumerate() {
        if ev.rank != position {
            return Err(MusterError::backend(format!(
                "gather has duplicate or missing rank: expected rank {} at position {}, got {}",
                position, position, ev.rank
            )));
        }
        if ev.values.len() != names.len() {
            return Err(MusterError::backend(format!(
                "rank {} answered {} values for {} names",
                ev.rank,
                ev.values.len(),
                names.len()
            )));
        }
    }

    let mut output: HashMap<String, Vec<Value>> = HashMap::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        let per_rank: Vec<Value> = gathered.iter().map(|ev| ev.values[idx].clone()).collect();
        output.insert(name.clone(), per_rank);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ev(rank: usize, values: Vec<Value>) -> EngineValues {
        EngineValues { rank, values }
    }

    #[test]
    fn orders_by_rank_regardless_of_arrival() {
        let names = vec!["x".to_string()];
        // Replies arrived high-rank-first.
        let gathered = vec![
            ev(2, vec![json!(20)]),
            ev(0, vec![json!(0)]),
            ev(1, vec![json!(10)]),
        ];
        let output = assemble_pull(&names, gathered, 3).unwrap();
        assert_eq!(output["x"], vec![json!(0), json!(10), json!(20)]);
    }

    #[test]
    fn multiple_names_keep_request_order_per_rank() {
        let names = vec!["a".to_string(), "b".to_string()];
        let gathered = vec![
            ev(1, vec![json!("a1"), json!("b1")]),
            ev(0, vec![json!("a0"), json!("b0")]),
        ];
        let output = assemble_pull(&names, gathered, 2).unwrap();
        assert_eq!(output["a"], vec![json!("a0"), json!("a1")]);
        assert_eq!(output["b"], vec![json!("b0"), json!("b1")]);
    }

    #[test]
    fn missing_worker_fails_whole_gather() {
        let names = vec!["x".to_string()];
        let gathered = vec![ev(0, vec![json!(1)])];
        assert!(assemble_pull(&names, gathered, 2).is_err());
    }

    #[test]
    fn duplicate_rank_is_rejected() {
        let names = vec!["x".to_string()];
        let gathered = vec![ev(0, vec![json!(1)]), ev(0, vec![json!(2)])];
        let err = assemble_pull(&names, gathered, 2).unwrap_err();
        assert!(err.to_string().contains("duplicate or missing rank"));
    }

    #[test]
    fn short_answer_is_rejected() {
        let names = vec!["a".to_string(), "b".to_string()];
        let gathered = vec![ev(0, vec![json!(1)])];
        assert!(assemble_pull(&names, gathered, 1).is_err());
    }
}
