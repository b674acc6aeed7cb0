/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Fuzzy search over node labels.

use nucleo::pattern::{CaseMatching, Normalization, Pattern};
use nucleo::{Config, Matcher};

use crate::graph::LoadedGraph;

struct SearchCandidate<K> {
    key: K,
    text: String,
}

impl<K> AsRef<str> for SearchCandidate<K> {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

/// Rank `(key, text)` pairs by fuzzy match quality for `query`, best first.
/// Non-matching candidates are dropped.
pub fn fuzzy_rank<K>(candidates: impl IntoIterator<Item = (K, String)>, query: &str) -> Vec<K> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }

    let normalized_query = query.to_lowercase();
    let pattern = Pattern::parse(
        &normalized_query,
        CaseMatching::Respect,
        Normalization::Never,
    );
    let mut matcher = Matcher::new(Config::DEFAULT);

    let candidates = candidates.into_iter().map(|(key, text)| SearchCandidate {
        key,
        text: text.to_lowercase(),
    });

    pattern
        .match_list(candidates, &mut matcher)
        .into_iter()
        .map(|(candidate, _score)| candidate.key)
        .collect()
}

/// Ids of loaded nodes whose label or id matches `query`, best first.
pub fn search_loaded(graph: &LoadedGraph, query: &str) -> Vec<String> {
    fuzzy_rank(
        graph
            .nodes()
            .map(|(_, node)| (node.id.clone(), format!("{} {}", node.label, node.id))),
        query,
    )
}
