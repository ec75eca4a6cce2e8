//! Generation engine.
//!
//! Turns (brief, checks, attachments, prior tree) into a complete file tree
//! via the LLM capability, with a verification/repair loop against the
//! acceptance checks. The engine never talks to the repository host; it only
//! produces a sanitized tree plus a verdict per check.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::DeployError;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};

/// System prompt for generation calls. The JSON-only contract is what the
/// staged parser below relies on.
const GENERATION_SYSTEM_PROMPT: &str = "You are a code generator that ONLY outputs valid JSON. \
Never include explanations or markdown. Follow instructions precisely. \
Always complete your JSON response fully.";

/// System prompt for verification calls.
const VERIFICATION_SYSTEM_PROMPT: &str = "You are a strict code reviewer. \
You answer ONLY with a JSON array of booleans, nothing else.";

/// Output budget for one generation call.
const GENERATION_MAX_TOKENS: u64 = 8000;

/// One entry of a generated file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    /// UTF-8 text content
    Text(String),
    /// Raw binary content
    Binary(Vec<u8>),
    /// Explicit deletion marker for a path present in the prior tree
    Delete,
}

impl TreeEntry {
    pub fn is_delete(&self) -> bool {
        matches!(self, TreeEntry::Delete)
    }

    /// Text content, if this is a text entry.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TreeEntry::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Pass/fail verdict for one acceptance check.
#[derive(Debug, Clone)]
pub struct CheckVerdict {
    pub check: String,
    pub passed: bool,
}

/// Result of one generation: an ordered path-to-content mapping plus a
/// verdict per check. Every path is relative and contained within the
/// project root.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub files: BTreeMap<String, TreeEntry>,
    pub verdicts: Vec<CheckVerdict>,
}

impl GenerationResult {
    pub fn passing_count(&self) -> usize {
        self.verdicts.iter().filter(|v| v.passed).count()
    }

    pub fn all_passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }

    pub fn failing_checks(&self) -> Vec<&str> {
        self.verdicts
            .iter()
            .filter(|v| !v.passed)
            .map(|v| v.check.as_str())
            .collect()
    }
}

/// Generation engine driving the LLM capability.
pub struct Engine {
    llm: Arc<dyn LlmClient>,
    model: String,
    max_repairs: u32,
}

impl Engine {
    pub fn new(llm: Arc<dyn LlmClient>, model: String, max_repairs: u32) -> Self {
        Self {
            llm,
            model,
            max_repairs,
        }
    }

    /// Generate a file tree satisfying the brief and checks.
    ///
    /// Runs at most `1 + max_repairs` generation calls; failing checks (and
    /// unparseable output) are fed back as repair instructions. Returns the
    /// best attempt by passing-check count when the repair budget runs out.
    pub async fn generate(
        &self,
        brief: &str,
        checks: &[String],
        attachment_names: &[String],
        prior_tree: Option<&BTreeMap<String, String>>,
    ) -> Result<GenerationResult, DeployError> {
        let base_prompt = match prior_tree {
            Some(tree) => build_revision_prompt(brief, checks, attachment_names, tree),
            None => build_initial_prompt(brief, checks, attachment_names),
        };
        let mut prompt = base_prompt.clone();

        let mut best: Option<GenerationResult> = None;
        let mut last_failure = String::new();

        for attempt in 0..=self.max_repairs {
            let response = self
                .llm
                .chat_completion(
                    &self.model,
                    &[
                        ChatMessage::system(GENERATION_SYSTEM_PROMPT),
                        ChatMessage::user(prompt.clone()),
                    ],
                    ChatOptions {
                        temperature: Some(0.2),
                        max_tokens: Some(GENERATION_MAX_TOKENS),
                    },
                )
                .await
                .map_err(|e| DeployError::GenerationFailed(e.to_string()))?;

            let raw_tree = match parse_file_tree(&response.content) {
                Ok(t) => t,
                Err(reason) => {
                    tracing::warn!(
                        "generation attempt {} produced unparseable output: {}",
                        attempt + 1,
                        reason
                    );
                    last_failure = reason.clone();
                    prompt = build_reparse_prompt(&base_prompt, &reason);
                    continue;
                }
            };

            // Unsafe paths abort the whole generation; a model that emits
            // traversal paths is not given another chance to hide them.
            let mut files = BTreeMap::new();
            for (path, content) in raw_tree {
                let clean = sanitize_path(&path)?;
                let entry = match content {
                    Some(text) => TreeEntry::Text(text),
                    None => TreeEntry::Delete,
                };
                files.insert(clean, entry);
            }

            if files.is_empty() {
                last_failure = "model returned an empty file tree".to_string();
                prompt = build_reparse_prompt(&base_prompt, &last_failure);
                continue;
            }

            // Checks describe the deployed site, which is the prior tree
            // with this round's changes applied, not the delta alone.
            let verdicts = self.verify(checks, &merged_view(prior_tree, &files)).await;
            let result = GenerationResult { files, verdicts };

            if result.all_passed() {
                tracing::info!(
                    "generation passed all {} checks on attempt {}",
                    checks.len(),
                    attempt + 1
                );
                return Ok(result);
            }

            tracing::info!(
                "generation attempt {} passed {}/{} checks",
                attempt + 1,
                result.passing_count(),
                checks.len()
            );

            let failing: Vec<String> = result
                .failing_checks()
                .iter()
                .map(|s| s.to_string())
                .collect();
            let better = best
                .as_ref()
                .map(|b| result.passing_count() > b.passing_count())
                .unwrap_or(true);
            if better {
                best = Some(result.clone());
            }

            if attempt < self.max_repairs {
                prompt = build_repair_prompt(brief, &failing, &result.files);
            }
        }

        // The caller decides whether "mostly passing" still counts as
        // deployable; the verdict array travels with the best attempt.
        best.ok_or_else(|| {
            DeployError::GenerationFailed(format!(
                "no usable file tree after {} attempts: {}",
                self.max_repairs + 1,
                last_failure
            ))
        })
    }

    /// Evaluate each check against the post-commit view of the tree.
    ///
    /// Checks with a mechanical phrasing (file presence, MIT license) are
    /// evaluated statically; the rest go to the model in a single verdict
    /// call. An unverifiable batch is treated as passing rather than
    /// triggering repairs on guesswork.
    async fn verify(
        &self,
        checks: &[String],
        files: &BTreeMap<String, TreeEntry>,
    ) -> Vec<CheckVerdict> {
        let mut verdicts: Vec<Option<bool>> = Vec::with_capacity(checks.len());
        let mut llm_checks: Vec<(usize, &str)> = Vec::new();

        for (i, check) in checks.iter().enumerate() {
            match static_verdict(check, files) {
                Some(passed) => verdicts.push(Some(passed)),
                None => {
                    verdicts.push(None);
                    llm_checks.push((i, check));
                }
            }
        }

        if !llm_checks.is_empty() {
            let prompt = build_verdict_prompt(
                &llm_checks.iter().map(|(_, c)| *c).collect::<Vec<_>>(),
                files,
            );
            let outcome = self
                .llm
                .chat_completion(
                    &self.model,
                    &[
                        ChatMessage::system(VERIFICATION_SYSTEM_PROMPT),
                        ChatMessage::user(prompt),
                    ],
                    ChatOptions {
                        temperature: Some(0.0),
                        max_tokens: Some(512),
                    },
                )
                .await;

            let parsed = match outcome {
                Ok(resp) => parse_verdicts(&resp.content, llm_checks.len()),
                Err(e) => {
                    tracing::warn!("verdict call failed, treating checks as passing: {}", e);
                    None
                }
            };

            match parsed {
                Some(flags) => {
                    for ((i, _), passed) in llm_checks.iter().zip(flags) {
                        verdicts[*i] = Some(passed);
                    }
                }
                None => {
                    for (i, _) in &llm_checks {
                        verdicts[*i] = Some(true);
                    }
                }
            }
        }

        checks
            .iter()
            .zip(verdicts)
            .map(|(check, passed)| CheckVerdict {
                check: check.clone(),
                passed: passed.unwrap_or(true),
            })
            .collect()
    }
}

/// The tree as it would look after committing: prior files overlaid with
/// this round's entries, deletions removed.
fn merged_view(
    prior: Option<&BTreeMap<String, String>>,
    files: &BTreeMap<String, TreeEntry>,
) -> BTreeMap<String, TreeEntry> {
    let mut view: BTreeMap<String, TreeEntry> = prior
        .map(|tree| {
            tree.iter()
                .map(|(path, content)| (path.clone(), TreeEntry::Text(content.clone())))
                .collect()
        })
        .unwrap_or_default();
    for (path, entry) in files {
        match entry {
            TreeEntry::Delete => {
                view.remove(path);
            }
            other => {
                view.insert(path.clone(), other.clone());
            }
        }
    }
    view
}

/// Statically decidable checks: file presence and the MIT license rule.
fn static_verdict(check: &str, files: &BTreeMap<String, TreeEntry>) -> Option<bool> {
    let lower = check.to_lowercase();

    if lower.contains("mit license") {
        let passed = files
            .get("LICENSE")
            .and_then(|e| e.as_text())
            .map(|t| t.contains("MIT License"))
            .unwrap_or(false);
        return Some(passed);
    }

    // "index.html exists", "has a style.css file", ...
    if lower.contains("exist") || lower.contains("file") {
        if let Some(name) = referenced_file_name(check) {
            return Some(files.contains_key(&name));
        }
    }

    None
}

/// Extract a concrete file name mentioned in a check string, if any.
fn referenced_file_name(check: &str) -> Option<String> {
    let re = regex::Regex::new(r"[\w./-]+\.(?:html|css|js|json|md|csv|txt|svg|png)").ok()?;
    re.find(check).map(|m| m.as_str().to_string())
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn checks_block(checks: &[String]) -> String {
    if checks.is_empty() {
        "- (none)".to_string()
    } else {
        checks
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn attachments_block(attachment_names: &[String]) -> String {
    if attachment_names.is_empty() {
        return String::new();
    }
    let names = attachment_names
        .iter()
        .map(|n| format!("- {}", n))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"
**Available Attachments:**
{names}

**How to access attachments:**
- All attachments live in `attachments.js` (auto-generated, never produce it yourself)
- Import it with `<script src="attachments.js"></script>`
- `window.attachments["filename.ext"]` returns a base64-encoded data URI string
- Never embed data URIs directly in HTML attributes; assign them from JavaScript,
  e.g. `document.getElementById('img1').src = window.attachments['image.png'];`
- Decode text data with `atob(window.attachments['data.csv'].split(',')[1])`
- The brief says what to do with each attachment; follow it precisely
"#
    )
}

const OUTPUT_CONTRACT: &str = r##"
**Output Format:**
Return ONLY a valid JSON object mapping file path to file content. No
explanations, no markdown fences, no extra text.
- Start with { and end with }
- Double quotes for keys and string values
- Escape special characters: \" for quotes, \n for newlines, \\ for backslashes
- No trailing commas, no comments
- A null value deletes that file from the project

Example:
{
  "index.html": "<!DOCTYPE html>\n<html>...</html>",
  "README.md": "# Title\n\nDescription",
  "style.css": "body { margin: 0; }"
}

Only include files you are creating or modifying. Return ONLY the JSON."##;

fn build_initial_prompt(brief: &str, checks: &[String], attachment_names: &[String]) -> String {
    format!(
        r#"Create a simple web application using only vanilla HTML, CSS, and JavaScript.

**Brief:** {brief}

**Evaluation criteria (ALL must be satisfied):**
{checks}

**README.md requirements:**
- Write a detailed README.md: what the application does, how to use it,
  features, and any special instructions.
{attachments}
**Technical requirements:**
- Vanilla HTML, CSS, JavaScript only (no frameworks or libraries)
- Main entry point must be index.html
- Pay attention to URL parameters, timing requirements, or specific behaviors
  named in the evaluation criteria
{contract}"#,
        brief = brief,
        checks = checks_block(checks),
        attachments = attachments_block(attachment_names),
        contract = OUTPUT_CONTRACT,
    )
}

fn build_revision_prompt(
    brief: &str,
    checks: &[String],
    attachment_names: &[String],
    prior_tree: &BTreeMap<String, String>,
) -> String {
    let existing = prior_tree
        .iter()
        .map(|(path, content)| format!("=== {} ===\n{}", path, content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        r#"You are modifying an EXISTING web application. Build upon the current code.

**New requirements to ADD or MODIFY:** {brief}

**Evaluation criteria (ALL must be satisfied):**
{checks}

**Current code (do not discard; build upon this):**
{existing}
{attachments}
**Instructions:**
- BUILD UPON the existing code; preserve existing functionality unless the
  new requirements say otherwise
- Update README.md with the new features and changes
- Vanilla HTML, CSS, JavaScript only
- Never include attachments.js in your output (it is auto-generated)
{contract}"#,
        brief = brief,
        checks = checks_block(checks),
        existing = existing,
        attachments = attachments_block(attachment_names),
        contract = OUTPUT_CONTRACT,
    )
}

fn build_repair_prompt(
    brief: &str,
    failing_checks: &[String],
    files: &BTreeMap<String, TreeEntry>,
) -> String {
    let current = files
        .iter()
        .filter_map(|(path, entry)| entry.as_text().map(|t| format!("=== {} ===\n{}", path, t)))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        r#"Your previous version of this web application fails some evaluation criteria.

**Brief:** {brief}

**FAILING criteria (fix these):**
{checks}

**Current code:**
{current}

Modify the code so every failing criterion passes. Preserve what already
works. Never include attachments.js in your output.
{contract}"#,
        brief = brief,
        checks = checks_block(failing_checks),
        current = current,
        contract = OUTPUT_CONTRACT,
    )
}

/// Retry prompt after an unparseable response. Wraps the original task
/// prompt so an incremental round keeps its prior-tree and attachment
/// context instead of regenerating from scratch.
fn build_reparse_prompt(base: &str, reason: &str) -> String {
    format!(
        "Your previous response could not be parsed as a JSON file tree: {reason}\n\n\
         Follow the instructions below again, and this time return ONLY the JSON object.\n\n\
         {base}"
    )
}

fn build_verdict_prompt(checks: &[&str], files: &BTreeMap<String, TreeEntry>) -> String {
    // Cap per-file content so the verdict call stays small.
    const PER_FILE_CAP: usize = 4000;
    let tree = files
        .iter()
        .filter_map(|(path, entry)| {
            entry.as_text().map(|t| {
                let truncated = if t.len() > PER_FILE_CAP {
                    format!("{}\n... (truncated)", truncate_str(t, PER_FILE_CAP))
                } else {
                    t.to_string()
                };
                format!("=== {} ===\n{}", path, truncated)
            })
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let numbered = checks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i + 1, c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Given this web project:

{tree}

For each criterion below, judge whether the project satisfies it.

{numbered}

Respond with ONLY a JSON array of {n} booleans, one per criterion, in order.
Example: [true, false]"#,
        tree = tree,
        numbered = numbered,
        n = checks.len(),
    )
}

/// Cut a string to at most `max` bytes without splitting a character.
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an LLM response into path -> content (None marks deletion).
///
/// Staged fallbacks, most reliable first: strip markdown fences and parse
/// directly; slice the outermost braces and repair trailing commas; finally
/// extract individual "path": "content" pairs by regex.
pub fn parse_file_tree(raw: &str) -> Result<BTreeMap<String, Option<String>>, String> {
    let mut response = raw.trim();

    if let Some(rest) = response.strip_prefix("```json") {
        response = rest;
    } else if let Some(rest) = response.strip_prefix("```") {
        response = rest;
    }
    if let Some(rest) = response.strip_suffix("```") {
        response = rest;
    }
    let response = response.trim();

    if let Ok(files) = tree_from_value(serde_json::from_str(response)) {
        return Ok(files);
    }

    // Slice the outermost JSON object and repair trailing commas. Prose can
    // contain stray brace pairs (CSS rules, empty objects), so an empty map
    // here is a miss, not an answer; fall through to pair extraction.
    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if end > start {
            let slice = &response[start..=end];
            let repaired = regex::Regex::new(r",(\s*[}\]])")
                .expect("static regex")
                .replace_all(slice, "$1");
            if let Ok(files) = tree_from_value(serde_json::from_str(&repaired)) {
                if !files.is_empty() {
                    return Ok(files);
                }
            }
        }
    }

    // Last resort: pull out individual key/value pairs for known file types.
    let pair_re = regex::Regex::new(
        r#""([^"]+\.(?:html|css|js|md|json|txt|svg))"\s*:\s*"((?:[^"\\]|\\.)*)""#,
    )
    .expect("static regex");
    let mut files = BTreeMap::new();
    for cap in pair_re.captures_iter(response) {
        let path = cap[1].to_string();
        let escaped = format!("\"{}\"", &cap[2]);
        if let Ok(Value::String(content)) = serde_json::from_str::<Value>(&escaped) {
            files.insert(path, Some(content));
        }
    }
    if !files.is_empty() {
        return Ok(files);
    }

    Err("response is not a JSON object of file contents".to_string())
}

fn tree_from_value(
    parsed: Result<Value, serde_json::Error>,
) -> Result<BTreeMap<String, Option<String>>, String> {
    let value = parsed.map_err(|e| e.to_string())?;
    let obj = match value {
        Value::Object(map) => map,
        _ => return Err("top-level JSON value is not an object".to_string()),
    };
    let mut files = BTreeMap::new();
    for (path, content) in obj {
        match content {
            Value::String(s) => {
                files.insert(path, Some(s));
            }
            Value::Null => {
                files.insert(path, None);
            }
            other => {
                return Err(format!(
                    "file {:?} has non-string content ({})",
                    path,
                    type_name(&other)
                ));
            }
        }
    }
    Ok(files)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a verdict response into exactly `expected` booleans.
fn parse_verdicts(raw: &str, expected: usize) -> Option<Vec<bool>> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    let flags: Vec<bool> = serde_json::from_str(&trimmed[start..=end]).ok()?;
    if flags.len() == expected {
        Some(flags)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// Validate and normalize a generated path.
///
/// Rejects absolute paths, parent traversal, backslashes, drive colons and
/// empty segments; strips a leading `./`.
pub fn sanitize_path(path: &str) -> Result<String, DeployError> {
    let unsafe_path = || DeployError::UnsafeGeneratedPath(path.to_string());

    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed.len() > 200 {
        return Err(unsafe_path());
    }
    if trimmed.starts_with('/') || trimmed.contains('\\') || trimmed.contains(':') {
        return Err(unsafe_path());
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(unsafe_path());
    }

    let normalized = trimmed.strip_prefix("./").unwrap_or(trimmed);
    for segment in normalized.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(unsafe_path());
        }
    }
    Ok(normalized.to_string())
}

// ---------------------------------------------------------------------------
// Site post-processing
// ---------------------------------------------------------------------------

/// Close a truncated HTML document so the deployed entry point always parses.
pub fn complete_html(html: &str) -> String {
    let trimmed = html.trim_end();
    if trimmed.to_lowercase().ends_with("</html>") {
        return html.to_string();
    }
    if html.to_lowercase().contains("<html") && !html.to_lowercase().contains("</html>") {
        tracing::warn!("generated index.html appears truncated, auto-closing tags");
        return format!("{}\n</body>\n</html>", html);
    }
    html.to_string()
}

/// The `attachments.js` preamble plus a JSON map of name -> data URI.
pub fn build_attachments_js(attachments: &BTreeMap<String, String>) -> String {
    let json = serde_json::to_string_pretty(attachments).unwrap_or_else(|_| "{}".to_string());
    format!(
        "// Auto-generated attachments file\n\
         // Access attachments via: window.attachments[\"filename.ext\"]\n\
         window.attachments = {};\n",
        json
    )
}

/// Recover the attachment map from a previously committed `attachments.js`.
pub fn parse_attachments_js(content: &str) -> BTreeMap<String, String> {
    let re = regex::Regex::new(r"(?s)window\.attachments\s*=\s*(\{.*\})\s*;")
        .expect("static regex");
    let Some(cap) = re.captures(content) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<BTreeMap<String, String>>(&cap[1]) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!("failed to parse existing attachments.js: {}", e);
            BTreeMap::new()
        }
    }
}

/// MIT license text committed when a check asks for it or no LICENSE exists.
pub fn mit_license() -> String {
    r#"MIT License

Copyright (c) 2025

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
"#
    .to_string()
}

/// Minimal README used when the model did not produce one.
pub fn fallback_readme(repo_name: &str, brief: &str, checks: &[String]) -> String {
    let criteria = checks
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# {repo_name}\n\n\
         ## Overview\n\
         Auto-generated project based on: {brief}\n\n\
         ## Usage\n\
         1. Open `index.html` in a web browser\n\
         2. Follow any on-screen instructions\n\n\
         ## Technical Details\n\
         - Built with vanilla HTML, CSS, and JavaScript\n\
         - No external dependencies required\n\n\
         ## Evaluation Criteria\n\
         {criteria}\n"
    )
}
