//! Index range expansion.
//!
//! A range spec is a comma-separated list of integers and hyphenated
//! pairs. `1-3` expands ascending, `10-8` descending; duplicates across
//! sub-ranges are suppressed with first-occurrence order preserved.

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error("malformed index range token {token:?}")]
    Malformed { token: String },

    #[error("template {artifact}: indices {} not in the parent index set", format_indices(.indices))]
    SubsetViolation { artifact: String, indices: Vec<u32> },
}

fn format_indices(indices: &[u32]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand a range spec into an ordered list of unique indices.
///
/// Empty input yields an empty list.
pub fn expand_indices(spec: &str) -> Result<Vec<u32>, RangeError> {
    let mut out = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    if spec.trim().is_empty() {
        return Ok(out);
    }

    for token in spec.split(',') {
        let token = token.trim();
        match token.split_once('-') {
            Some((a, b)) => {
                let a: u32 = parse_bound(a, token)?;
                let b: u32 = parse_bound(b, token)?;
                if a <= b {
                    for i in a..=b {
                        if seen.insert(i) {
                            out.push(i);
                        }
                    }
                } else {
                    for i in (b..=a).rev() {
                        if seen.insert(i) {
                            out.push(i);
                        }
                    }
                }
            }
            None => {
                let i: u32 = token.parse().map_err(|_| RangeError::Malformed {
                    token: token.to_string(),
                })?;
                if seen.insert(i) {
                    out.push(i);
                }
            }
        }
    }

    Ok(out)
}

fn parse_bound(s: &str, token: &str) -> Result<u32, RangeError> {
    s.trim().parse().map_err(|_| RangeError::Malformed {
        token: token.to_string(),
    })
}

/// Verify that every child index is present in the parent index set.
pub fn check_subset(child: &[u32], parent: &[u32], artifact: &str) -> Result<(), RangeError> {
    let outside: Vec<u32> = child
        .iter()
        .copied()
        .filter(|i| !parent.contains(i))
        .collect();
    if outside.is_empty() {
        Ok(())
    } else {
        Err(RangeError::SubsetViolation {
            artifact: artifact.to_string(),
            indices: outside,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_descending_and_dedup() {
        assert_eq!(
            expand_indices("1-3,7,10-8").unwrap(),
            vec![1, 2, 3, 7, 10, 9, 8]
        );
    }

    #[test]
    fn overlap_keeps_first_occurrence() {
        assert_eq!(expand_indices("3-5,4-6").unwrap(), vec![3, 4, 5, 6]);
        assert_eq!(expand_indices("5,1-5").unwrap(), vec![5, 1, 2, 3, 4]);
    }

    #[test]
    fn single_values_and_whitespace() {
        assert_eq!(expand_indices(" 2 , 4 - 5 ").unwrap(), vec![2, 4, 5]);
    }

    #[test]
    fn empty_spec_is_empty() {
        assert!(expand_indices("").unwrap().is_empty());
        assert!(expand_indices("   ").unwrap().is_empty());
    }

    #[test]
    fn malformed_tokens_rejected() {
        for bad in ["a", "1-", "-3", "1-2-3", "1..4", ""] {
            let spec = format!("1,{bad}");
            assert!(
                matches!(expand_indices(&spec), Err(RangeError::Malformed { .. })),
                "expected failure for {bad:?}"
            );
        }
    }

    #[test]
    fn subset_check() {
        check_subset(&[1, 2], &[1, 2, 3, 4], "node.tpl").unwrap();
        check_subset(&[], &[1, 2], "node.tpl").unwrap();

        match check_subset(&[5, 6], &[1, 2, 3, 4], "node.tpl") {
            Err(RangeError::SubsetViolation { artifact, indices }) => {
                assert_eq!(artifact, "node.tpl");
                assert_eq!(indices, vec![5, 6]);
            }
            other => panic!("expected SubsetViolation, got {other:?}"),
        }
    }
}
