//! Steam storefront metadata enrichment.
//!
//! Best-effort: a failed lookup or download only costs the published game its
//! `steamdata/` directory, never the publish itself.

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::pipeline::PipelineError;

const SEARCH_URL: &str = "https://store.steampowered.com/api/storesearch/";
const DETAILS_URL: &str = "https://store.steampowered.com/api/appdetails";

/// Look `query` up on the storefront and save `appdetails.json` plus the
/// header, background, and screenshot images under `dest`.
pub fn enrich(query: &str, dest: &Path) -> Result<(), PipelineError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let search: Value = client
        .get(SEARCH_URL)
        .query(&[("term", query), ("l", "english"), ("cc", "us")])
        .send()?
        .error_for_status()?
        .json()?;
    let items = search
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let Some(best) = pick_best_match(query, &items) else {
        tracing::info!(query, "no storefront match");
        return Ok(());
    };
    let app_id = best
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| PipelineError::Config("storefront result missing app id".into()))?;
    let match_name = best.get("name").and_then(Value::as_str).unwrap_or("");
    tracing::info!(
        query,
        app_id,
        name = match_name,
        "storefront match selected"
    );

    let details: Value = client
        .get(DETAILS_URL)
        .query(&[("appids", app_id.to_string())])
        .send()?
        .error_for_status()?
        .json()?;
    let data = details
        .get(app_id.to_string().as_str())
        .and_then(|v| v.get("data"))
        .cloned()
        .unwrap_or(Value::Null);

    fs::create_dir_all(dest)?;
    fs::write(
        dest.join("appdetails.json"),
        serde_json::to_vec_pretty(&data)?,
    )?;

    let images = dest.join("images");
    fs::create_dir_all(&images)?;
    if let Some(url) = data.get("header_image").and_then(Value::as_str) {
        download(&client, url, &images.join("header.jpg"))?;
    }
    if let Some(url) = data.get("background").and_then(Value::as_str) {
        download(&client, url, &images.join("background.jpg"))?;
    }
    if let Some(shots) = data.get("screenshots").and_then(Value::as_array) {
        for (i, shot) in shots.iter().enumerate() {
            if let Some(url) = shot.get("path_full").and_then(Value::as_str) {
                download(&client, url, &images.join(format!("screenshot_{i}.jpg")))?;
            }
        }
    }
    Ok(())
}

fn download(
    client: &reqwest::blocking::Client,
    url: &str,
    path: &Path,
) -> Result<(), PipelineError> {
    let bytes = client.get(url).send()?.error_for_status()?.bytes()?;
    fs::write(path, &bytes)?;
    Ok(())
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

fn item_name(item: &Value) -> &str {
    item.get("name").and_then(Value::as_str).unwrap_or("")
}

/// Exact normalized title first, then strict token match (so "portal" never
/// resolves to "Portal 2"), then highest character-sequence similarity.
fn pick_best_match<'a>(query: &str, items: &'a [Value]) -> Option<&'a Value> {
    let q = normalize(query);
    let apps: Vec<&Value> = items
        .iter()
        .filter(|i| i.get("type").and_then(Value::as_str) == Some("app"))
        .collect();

    for item in &apps {
        if normalize(item_name(item)) == q {
            return Some(*item);
        }
    }

    let q_tokens: Vec<&str> = q.split_whitespace().collect();
    for item in &apps {
        let name = normalize(item_name(item));
        if name.split_whitespace().collect::<Vec<_>>() == q_tokens {
            return Some(*item);
        }
    }

    let mut best: Option<(f64, &'a Value)> = None;
    for item in apps {
        let score = similarity(&q, &normalize(item_name(item)));
        if best.as_ref().map(|(top, _)| score > *top).unwrap_or(true) {
            best = Some((score, item));
        }
    }
    best.map(|(_, item)| item)
}

/// Ratcliff/Obershelp similarity: twice the total length of the matching
/// blocks over the combined length. Handles typo'd queries ("portl") that
/// share no whole token with any title.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matched = matching_chars(&a, &b);
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

/// Total length of the matching blocks: take the longest common block, then
/// recurse into the pieces on either side of it.
fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (ai, bi, size) = longest_common_block(a, b);
    if size == 0 {
        return 0;
    }
    size + matching_chars(&a[..ai], &b[..bi]) + matching_chars(&a[ai + size..], &b[bi + size..])
}

fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    // run_ending_at[j] = length of the common run ending at a[i], b[j].
    let mut run_ending_at: HashMap<usize, usize> = HashMap::new();
    for (i, ac) in a.iter().enumerate() {
        let mut next: HashMap<usize, usize> = HashMap::new();
        for (j, bc) in b.iter().enumerate() {
            if ac == bc {
                let run = j
                    .checked_sub(1)
                    .and_then(|prev| run_ending_at.get(&prev))
                    .copied()
                    .unwrap_or(0)
                    + 1;
                next.insert(j, run);
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        run_ending_at = next;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_titles() {
        assert_eq!(normalize("Portal: 2!"), "portal 2");
        assert_eq!(normalize("  HALF-Life  "), "halflife");
    }

    #[test]
    fn prefers_exact_title_over_sequels() {
        let items = vec![
            json!({"type": "app", "name": "Portal 2", "id": 620}),
            json!({"type": "app", "name": "Portal", "id": 400}),
        ];
        let best = pick_best_match("portal", &items).unwrap();
        assert_eq!(best["id"], 400);
    }

    #[test]
    fn ignores_non_app_results() {
        let items = vec![
            json!({"type": "bundle", "name": "Portal", "id": 1}),
            json!({"type": "app", "name": "Portal", "id": 400}),
        ];
        let best = pick_best_match("portal", &items).unwrap();
        assert_eq!(best["id"], 400);
    }

    #[test]
    fn similarity_is_twice_matches_over_total() {
        // Matching block "bcd": 2 * 3 / 8.
        assert_eq!(similarity("abcd", "bcde"), 0.75);
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        assert_eq!(similarity("", ""), 1.0);
    }

    #[test]
    fn typo_falls_through_to_sequence_similarity() {
        // "portl" has no exact or whole-token match, and shares no whole
        // token with either title; character similarity still ranks
        // "Portal" (10/11) above "Portal 2" (10/13).
        let items = vec![
            json!({"type": "app", "name": "Portal 2", "id": 620}),
            json!({"type": "app", "name": "Portal", "id": 400}),
        ];
        let best = pick_best_match("portl", &items).unwrap();
        assert_eq!(best["id"], 400);
    }
}
