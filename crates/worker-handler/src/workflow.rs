//! Workflow graph loading and patching.
//!
//! A workflow is ComfyUI's API-format graph: a JSON object mapping node ids
//! to nodes (`{"class_type": ..., "inputs": {...}, "_meta": {"title": ...}}`).
//! Node order is preserved so that fallback lookups pick the first match in
//! file order.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;

/// Node id the bundled workflow uses for the positive prompt.
pub const PROMPT_NODE_ID: &str = "134";
/// Node id the bundled workflow uses for the input image.
pub const IMAGE_NODE_ID: &str = "148";

/// Number of node ids included in patch-failure diagnostics.
const KEYS_PREVIEW_LEN: usize = 15;

pub type Workflow = Map<String, Value>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("workflow json is not a dict (unexpected format)")]
    NotAnObject,

    #[error("workflow_patch_failed: cannot find CLIPTextEncode node to set prompt")]
    NoPromptNode,

    #[error("workflow_patch_failed: cannot find LoadImage node to set image filename")]
    NoImageNode,
}

/// Read a workflow file. Accepts the bare graph or a request-shaped wrapper
/// `{"input": {"workflow": {...}}}`.
pub fn load(path: &Path) -> Result<Workflow, WorkflowError> {
    let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Workflow, WorkflowError> {
    let mut value: Value = serde_json::from_str(text)?;

    if let Some(wrapped) = value
        .get_mut("input")
        .and_then(Value::as_object_mut)
        .and_then(|input| input.remove("workflow"))
    {
        value = wrapped;
    }

    match value {
        Value::Object(graph) => Ok(graph),
        _ => Err(WorkflowError::NotAnObject),
    }
}

/// Set the positive prompt text. Returns the id of the patched node.
///
/// Lookup order: node `134`; the first `CLIPTextEncode` whose title
/// contains "positive" (case-insensitive); the first `CLIPTextEncode`.
pub fn set_prompt(wf: &mut Workflow, prompt: &str) -> Result<String, WorkflowError> {
    let id = preferred_node(wf, PROMPT_NODE_ID)
        .or_else(|| find_node(wf, |node| is_class(node, "CLIPTextEncode") && title_contains(node, "positive")))
        .or_else(|| find_node(wf, |node| is_class(node, "CLIPTextEncode")))
        .ok_or(WorkflowError::NoPromptNode)?;

    set_input(wf, &id, "text", prompt);
    Ok(id)
}

/// Point the image loader at `filename`. Returns the id of the patched node.
///
/// Lookup order: node `148`; the first `LoadImage`.
pub fn set_image_filename(wf: &mut Workflow, filename: &str) -> Result<String, WorkflowError> {
    let id = preferred_node(wf, IMAGE_NODE_ID)
        .or_else(|| find_node(wf, |node| is_class(node, "LoadImage")))
        .ok_or(WorkflowError::NoImageNode)?;

    set_input(wf, &id, "image", filename);
    Ok(id)
}

/// First few node ids, in file order.
pub fn keys_preview(wf: &Workflow) -> Vec<String> {
    wf.keys().take(KEYS_PREVIEW_LEN).cloned().collect()
}

fn preferred_node(wf: &Workflow, id: &str) -> Option<String> {
    wf.get(id).filter(|node| node.is_object()).map(|_| id.to_string())
}

fn find_node(wf: &Workflow, predicate: impl Fn(&Map<String, Value>) -> bool) -> Option<String> {
    wf.iter()
        .find(|(_, node)| node.as_object().is_some_and(&predicate))
        .map(|(id, _)| id.clone())
}

fn is_class(node: &Map<String, Value>, class: &str) -> bool {
    node.get("class_type").and_then(Value::as_str) == Some(class)
}

fn title_contains(node: &Map<String, Value>, needle: &str) -> bool {
    node.get("_meta")
        .and_then(|meta| meta.get("title"))
        .and_then(Value::as_str)
        .is_some_and(|title| title.to_lowercase().contains(needle))
}

fn set_input(wf: &mut Workflow, id: &str, key: &str, value: &str) {
    let Some(node) = wf.get_mut(id).and_then(Value::as_object_mut) else {
        return;
    };
    let inputs = node
        .entry("inputs")
        .or_insert_with(|| Value::Object(Map::new()));
    if !inputs.is_object() {
        *inputs = Value::Object(Map::new());
    }
    if let Some(inputs) = inputs.as_object_mut() {
        inputs.insert(key.to_string(), Value::String(value.to_string()));
    }
}
