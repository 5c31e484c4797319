// Copyright 2025 Evalflow Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Dataset containers: standalone items and multi-step conversations

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A tool invocation recorded on a conversation step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,

    #[serde(default)]
    pub arguments: serde_json::Value,

    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            result: None,
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationStep {
    pub input: String,
    pub output: String,

    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ConversationStep {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// A standalone input/output pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetItem {
    #[serde(default)]
    pub id: Option<String>,

    pub input: String,

    pub output: String,

    /// Reference answer, when the dataset has one
    #[serde(default)]
    pub expected: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl DatasetItem {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: None,
            input: input.into(),
            output: output.into(),
            expected: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// An ordered, immutable sequence of steps.
///
/// Steps are only reachable through shared accessors; nothing downstream can
/// reorder or drop them once the conversation is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    #[serde(default)]
    id: Option<String>,

    steps: Vec<ConversationStep>,

    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

impl Conversation {
    pub fn new(steps: Vec<ConversationStep>) -> Self {
        Self {
            id: None,
            steps,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn steps(&self) -> &[ConversationStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&ConversationStep> {
        self.steps.get(index)
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Plain-text transcript, one `User:`/`Assistant:` pair per step
    pub fn transcript(&self) -> String {
        self.steps
            .iter()
            .map(|step| format!("User: {}\nAssistant: {}", step.input, step.output))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Unit a dataset is made of
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Container {
    Item(DatasetItem),
    Conversation(Conversation),
}

impl Container {
    pub fn id(&self) -> Option<&str> {
        match self {
            Container::Item(item) => item.id.as_deref(),
            Container::Conversation(conversation) => conversation.id(),
        }
    }

    /// The container's own id, or the positional fallback `target-<index>`
    pub fn target_id(&self, index: usize) -> String {
        match self.id() {
            Some(id) => id.to_string(),
            None => format!("target-{}", index),
        }
    }

    /// Number of addressable steps (an item counts as a single step)
    pub fn step_count(&self) -> usize {
        match self {
            Container::Item(_) => 1,
            Container::Conversation(conversation) => conversation.len(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Container::Item(_) => "item",
            Container::Conversation(_) => "conversation",
        }
    }
}

impl From<DatasetItem> for Container {
    fn from(item: DatasetItem) -> Self {
        Container::Item(item)
    }
}

impl From<Conversation> for Container {
    fn from(conversation: Conversation) -> Self {
        Container::Conversation(conversation)
    }
}

/// Ordered, fully materialized collection of containers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Dataset {
    containers: Vec<Container>,
}

impl Dataset {
    pub fn new(containers: Vec<Container>) -> Self {
        Self { containers }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let dataset: Dataset = serde_json::from_str(json)?;
        tracing::debug!(containers = dataset.len(), "Parsed dataset");
        Ok(dataset)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Container> {
        self.containers.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Container> {
        self.containers.get(index)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Target ids in dataset order
    pub fn target_ids(&self) -> Vec<String> {
        self.containers
            .iter()
            .enumerate()
            .map(|(index, container)| container.target_id(index))
            .collect()
    }

    /// Reject datasets whose target ids collide, explicit or positional
    pub fn validate_target_ids(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for id in self.target_ids() {
            if !seen.insert(id.clone()) {
                return Err(CoreError::DuplicateTargetId(id));
            }
        }
        Ok(())
    }
}

impl From<Vec<Container>> for Dataset {
    fn from(containers: Vec<Container>) -> Self {
        Self::new(containers)
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Container;
    type IntoIter = std::slice::Iter<'a, Container>;

    fn into_iter(self) -> Self::IntoIter {
        self.containers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_mixed_dataset() {
        let json = r#"[
            {"type": "item", "id": "q1", "input": "2+2?", "output": "4", "expected": "4"},
            {"type": "conversation", "steps": [
                {"input": "hi", "output": "hello"},
                {"input": "weather?", "output": "sunny", "tool_calls": [
                    {"name": "get_weather", "arguments": {"city": "Paris"}}
                ]}
            ]}
        ]"#;

        let dataset = Dataset::from_json_str(json).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.target_ids(), vec!["q1", "target-1"]);

        match dataset.get(1).unwrap() {
            Container::Conversation(conversation) => {
                assert_eq!(conversation.len(), 2);
                assert_eq!(conversation.steps()[1].tool_calls[0].name, "get_weather");
            }
            other => panic!("expected conversation, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_target_ids_rejected() {
        let dataset = Dataset::new(vec![
            DatasetItem::new("a", "b").with_id("target-1").into(),
            DatasetItem::new("c", "d").into(),
        ]);
        assert!(matches!(
            dataset.validate_target_ids(),
            Err(CoreError::DuplicateTargetId(id)) if id == "target-1"
        ));
    }

    #[test]
    fn test_transcript() {
        let conversation = Conversation::new(vec![
            ConversationStep::new("hi", "hello"),
            ConversationStep::new("bye", "see you"),
        ]);
        assert_eq!(
            conversation.transcript(),
            "User: hi\nAssistant: hello\nUser: bye\nAssistant: see you"
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"type": "item", "input": "x", "output": "y"}}]"#
        )
        .unwrap();

        let dataset = Dataset::from_json_file(file.path()).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.get(0).unwrap().step_count(), 1);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Dataset::from_json_file(Path::new("/nonexistent/dataset.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dataset.json"));
    }
}
