// LoanFetch - Library Loan Downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Batch selection over a listed loan set

use crate::api::loans::Loan;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Which loans of a listing to process
///
/// Indices are 1-based positions in the listing order. All criteria are
/// combined; a loan picked twice is processed once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub indices: Vec<usize>,
    pub ids: Vec<String>,
    /// Most recently checked out loans
    pub latest: Option<usize>,
}

impl Selection {
    pub fn by_indices<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        Self {
            indices: indices.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn by_ids<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn latest(count: usize) -> Self {
        Self {
            latest: Some(count),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty() && self.ids.is_empty() && self.latest.is_none()
    }
}

/// Loans picked by a selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selected {
    /// `(1-based index, loan)` in selection order
    pub loans: Vec<(usize, Loan)>,
    /// Entries that matched nothing, as the user wrote them
    pub not_found: Vec<String>,
}

/// Apply `selection` to `loans`, which must already be in listing order
pub fn select(loans: &[Loan], selection: &Selection) -> Selected {
    let mut picked: Vec<usize> = Vec::new();
    let mut seen = HashSet::new();
    let mut not_found = Vec::new();

    let mut pick = |position: usize, picked: &mut Vec<usize>| {
        if seen.insert(position) {
            picked.push(position);
        }
    };

    for &index in &selection.indices {
        if index >= 1 && index <= loans.len() {
            pick(index - 1, &mut picked);
        } else {
            not_found.push(index.to_string());
        }
    }

    for id in &selection.ids {
        match loans.iter().position(|l| &l.id == id) {
            Some(position) => pick(position, &mut picked),
            None => not_found.push(id.clone()),
        }
    }

    if let Some(count) = selection.latest {
        let start = loans.len().saturating_sub(count);
        for position in start..loans.len() {
            pick(position, &mut picked);
        }
    }

    Selected {
        loans: picked.into_iter().map(|p| (p + 1, loans[p].clone())).collect(),
        not_found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loans(ids: &[&str]) -> Vec<Loan> {
        ids.iter()
            .map(|id| Loan {
                id: id.to_string(),
                title: format!("Title {}", id),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_select_by_index_reports_unknown() {
        let listing = loans(&["a", "b", "c"]);
        let selected = select(&listing, &Selection::by_indices([1, 5]));
        assert_eq!(selected.loans.len(), 1);
        assert_eq!(selected.loans[0].0, 1);
        assert_eq!(selected.loans[0].1.id, "a");
        assert_eq!(selected.not_found, vec!["5".to_string()]);
    }

    #[test]
    fn test_index_zero_is_not_found() {
        let listing = loans(&["a"]);
        let selected = select(&listing, &Selection::by_indices([0]));
        assert!(selected.loans.is_empty());
        assert_eq!(selected.not_found, vec!["0".to_string()]);
    }

    #[test]
    fn test_select_by_id_and_dedupe() {
        let listing = loans(&["a", "b", "c"]);
        let selection = Selection {
            indices: vec![3],
            ids: vec!["c".into(), "zz".into(), "b".into()],
            latest: None,
        };
        let selected = select(&listing, &selection);
        let ids: Vec<_> = selected.loans.iter().map(|(_, l)| l.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert_eq!(selected.not_found, vec!["zz".to_string()]);
    }

    #[test]
    fn test_latest_takes_tail_of_listing() {
        let listing = loans(&["a", "b", "c"]);
        let selected = select(&listing, &Selection::latest(2));
        let indices: Vec<_> = selected.loans.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![2, 3]);

        let all = select(&listing, &Selection::latest(10));
        assert_eq!(all.loans.len(), 3);
        assert!(all.not_found.is_empty());
    }
}
