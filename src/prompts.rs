//! Instruction templates for the three extraction capabilities.
//!
//! Centralising every template here serves two purposes:
//!
//! 1. **Single source of truth** — the pipeline's behaviour is fixed by these
//!    three templates; tightening a rule means editing exactly one place.
//!
//! 2. **Testability** — stub models in tests match on
//!    [`crate::pipeline::client::InstructionId`] to decide which scripted
//!    response to return, and unit tests can inspect template content without
//!    a live model.
//!
//! The templates are deliberately not configurable: the capability contract
//! is "a fixed instruction plus caller content", and per-call prompt
//! injection would make validation verdicts meaningless.

/// Instruction for the raw-extract capability: photographed pages → one HTML
/// document.
pub const RAW_EXTRACT_PROMPT: &str = r#"You are an expert transcriber of photographed poetry pages. You receive one or more photos that together contain a single poem, in page order. Produce one HTML rendering of the complete poem.

Follow these rules precisely:

1. TEXT PRESERVATION
   - Transcribe ALL poem text completely and accurately
   - Keep the pages in the order given; page order is stanza order
   - Correct an obviously misread character only if you are completely certain

2. STRUCTURE
   - Exactly one <h1> element containing the poem's title
   - One <p> element per stanza
   - A <br> at the end of every verse line except the last line of a stanza
   - Keep the poet's line breaks exactly; never re-wrap verse lines

3. WHAT TO IGNORE
   - Page numbers, handwritten margin notes, stains and shadows
   - Book headers or footers repeated on every page
   - Anything on the page that is not part of the poem itself

4. OUTPUT FORMAT
   - Output ONLY the HTML fragment, starting with the <h1>
   - Do NOT wrap it in ```html fences
   - Do NOT add commentary, <html> or <body> wrappers"#;

/// Instruction for the validate capability: candidate HTML → JSON verdict.
pub const VALIDATE_PROMPT: &str = r#"You are a strict HTML reviewer for transcribed poems. You receive one HTML fragment that should contain a poem. Check it for structural problems.

Check these rules:

1. Exactly one <h1> title element, non-empty
2. Every tag balanced and properly nested; only <h1>, <p>, <br>, <em>, <strong> allowed
3. At least one <p> stanza with visible text
4. No leftover transcription artifacts: page numbers, "Page 2", OCR garbage, editor commentary
5. No Markdown syntax leaking into the HTML (#, **, backticks)

Respond with ONLY a JSON object, no fences, in this exact shape:
{"valid": true|false, "issues": ["<problem>", ...], "repaired_html": "<corrected fragment>"|null}

- "valid" true means the fragment passes every rule as-is; then use [] and null
- When invalid, list each problem in "issues" and put your best corrected version of the full fragment in "repaired_html"
- Never change the poem's words while repairing; fix structure only"#;

/// Instruction for the derive capability: validated HTML → title + Markdown.
pub const DERIVE_PROMPT: &str = r#"You receive the final HTML of a transcribed poem. Produce its plain-text title and an equivalent Markdown rendering.

Follow these rules precisely:

1. "title" is the text content of the <h1>, with no markup
2. "markdown" renders the same poem: the title as a # heading, one paragraph per stanza, and two trailing spaces at the end of every verse line except the last of a stanza
3. Do not add, drop or reword any line

Respond with ONLY a JSON object, no fences, in this exact shape:
{"title": "<poem title>", "markdown": "<markdown text>"}"#;
