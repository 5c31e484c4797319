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

//! Target selection: which steps or items a metric is measured against

use crate::metric::MetricScope;
use crate::EvalError;
use evalflow_core::{Container, Conversation, ConversationStep, DatasetItem, ToolCall};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which parts of the dataset single-scope metrics run on.
///
/// - `All`: every item and every conversation step
/// - `SelectedSteps`: the listed step indices of every conversation; a
///   standalone item is step 0
/// - `SelectedItems`: only the containers at the listed dataset positions,
///   with all of their steps
///
/// Multi-scope metrics always run once per container regardless of policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "indices", rename_all = "snake_case")]
pub enum RunPolicy {
    #[default]
    All,
    SelectedSteps(Vec<usize>),
    SelectedItems(Vec<usize>),
}

impl RunPolicy {
    /// Check dataset-level indices before anything runs
    pub fn validate(&self, dataset_len: usize) -> Result<(), EvalError> {
        if let RunPolicy::SelectedItems(indices) = self {
            if let Some(bad) = indices.iter().find(|&&i| i >= dataset_len) {
                return Err(EvalError::config(format!(
                    "Selected item index {} is out of range for a dataset of {} containers",
                    bad, dataset_len
                )));
            }
        }
        Ok(())
    }
}

/// A single unit a metric is measured against
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// A standalone dataset item
    Item(&'a DatasetItem),

    /// One step of a conversation
    Step {
        conversation: &'a Conversation,
        index: usize,
        step: &'a ConversationStep,
    },

    /// A whole conversation (multi-scope metrics)
    Conversation(&'a Conversation),
}

impl<'a> Target<'a> {
    /// Step index within the container, `None` for whole-container targets
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Target::Step { index, .. } => Some(*index),
            Target::Item(_) | Target::Conversation(_) => None,
        }
    }

    /// User input. A whole conversation reports its first step's input.
    pub fn input(&self) -> &'a str {
        match self {
            Target::Item(item) => &item.input,
            Target::Step { step, .. } => &step.input,
            Target::Conversation(conversation) => conversation
                .steps()
                .first()
                .map(|s| s.input.as_str())
                .unwrap_or(""),
        }
    }

    /// Model output. A whole conversation reports its last step's output.
    pub fn output(&self) -> &'a str {
        match self {
            Target::Item(item) => &item.output,
            Target::Step { step, .. } => &step.output,
            Target::Conversation(conversation) => conversation
                .steps()
                .last()
                .map(|s| s.output.as_str())
                .unwrap_or(""),
        }
    }

    pub fn expected(&self) -> Option<&'a str> {
        match self {
            Target::Item(item) => item.expected.as_deref(),
            _ => None,
        }
    }

    pub fn tool_calls(&self) -> Vec<&'a ToolCall> {
        match self {
            Target::Item(_) => Vec::new(),
            Target::Step { step, .. } => step.tool_calls.iter().collect(),
            Target::Conversation(conversation) => conversation
                .steps()
                .iter()
                .flat_map(|s| s.tool_calls.iter())
                .collect(),
        }
    }

    /// Conversation history up to and including this target
    pub fn transcript(&self) -> String {
        match self {
            Target::Item(item) => format!("User: {}\nAssistant: {}", item.input, item.output),
            Target::Step {
                conversation,
                index,
                ..
            } => conversation.steps()[..=*index]
                .iter()
                .map(|s| format!("User: {}\nAssistant: {}", s.input, s.output))
                .collect::<Vec<_>>()
                .join("\n"),
            Target::Conversation(conversation) => conversation.transcript(),
        }
    }

    /// Canonical content used to fingerprint the target for result caching
    pub fn fingerprint(&self) -> serde_json::Value {
        match self {
            Target::Item(item) => serde_json::json!({
                "kind": "item",
                "input": item.input,
                "output": item.output,
                "expected": item.expected,
            }),
            Target::Step {
                conversation,
                index,
                ..
            } => serde_json::json!({
                "kind": "step",
                "index": index,
                "history": &conversation.steps()[..=*index],
            }),
            Target::Conversation(conversation) => serde_json::json!({
                "kind": "conversation",
                "steps": conversation.steps(),
            }),
        }
    }
}

/// Resolve the run policy against one container.
///
/// Targets come back in their original order.
pub fn select_targets<'a>(
    container: &'a Container,
    container_index: usize,
    scope: MetricScope,
    policy: &RunPolicy,
) -> Result<Vec<Target<'a>>, EvalError> {
    if scope == MetricScope::Multi {
        return Ok(vec![whole_container(container)]);
    }

    match container {
        Container::Item(item) => {
            let selected = match policy {
                RunPolicy::All => true,
                RunPolicy::SelectedSteps(indices) => indices.contains(&0),
                RunPolicy::SelectedItems(indices) => indices.contains(&container_index),
            };
            Ok(if selected {
                vec![Target::Item(item)]
            } else {
                Vec::new()
            })
        }
        Container::Conversation(conversation) => {
            let indices: Vec<usize> = match policy {
                RunPolicy::All => (0..conversation.len()).collect(),
                RunPolicy::SelectedItems(items) => {
                    if items.contains(&container_index) {
                        (0..conversation.len()).collect()
                    } else {
                        Vec::new()
                    }
                }
                RunPolicy::SelectedSteps(steps) => {
                    let unique: BTreeSet<usize> = steps.iter().copied().collect();
                    if let Some(bad) = unique.iter().find(|&&i| i >= conversation.len()) {
                        return Err(EvalError::config(format!(
                            "Selected step {} is out of range for conversation '{}' with {} steps",
                            bad,
                            container.target_id(container_index),
                            conversation.len()
                        )));
                    }
                    unique.into_iter().collect()
                }
            };

            Ok(indices
                .into_iter()
                .map(|index| Target::Step {
                    conversation,
                    index,
                    step: &conversation.steps()[index],
                })
                .collect())
        }
    }
}

fn whole_container(container: &Container) -> Target<'_> {
    match container {
        Container::Item(item) => Target::Item(item),
        Container::Conversation(conversation) => Target::Conversation(conversation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(len: usize) -> Container {
        Conversation::new(
            (0..len)
                .map(|i| ConversationStep::new(format!("q{}", i), format!("a{}", i)))
                .collect(),
        )
        .into()
    }

    #[test]
    fn test_all_steps_in_order() {
        let container = conversation(3);
        let targets = select_targets(&container, 0, MetricScope::Single, &RunPolicy::All).unwrap();
        let indices: Vec<_> = targets.iter().map(|t| t.step_index()).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(targets[1].output(), "a1");
    }

    #[test]
    fn test_selected_steps_sorted_and_deduplicated() {
        let container = conversation(4);
        let policy = RunPolicy::SelectedSteps(vec![3, 1, 3]);
        let targets = select_targets(&container, 0, MetricScope::Single, &policy).unwrap();
        let indices: Vec<_> = targets.iter().map(|t| t.step_index()).collect();
        assert_eq!(indices, vec![Some(1), Some(3)]);
    }

    #[test]
    fn test_selected_step_out_of_range() {
        let container = conversation(2);
        let policy = RunPolicy::SelectedSteps(vec![5]);
        let err = select_targets(&container, 0, MetricScope::Single, &policy).unwrap_err();
        assert!(matches!(err, EvalError::Config(_)));
    }

    #[test]
    fn test_selected_items() {
        let item: Container = DatasetItem::new("in", "out").into();
        let policy = RunPolicy::SelectedItems(vec![2]);
        assert!(select_targets(&item, 1, MetricScope::Single, &policy)
            .unwrap()
            .is_empty());
        assert_eq!(
            select_targets(&item, 2, MetricScope::Single, &policy)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_multi_scope_ignores_policy() {
        let container = conversation(3);
        let policy = RunPolicy::SelectedSteps(vec![0]);
        let targets = select_targets(&container, 0, MetricScope::Multi, &policy).unwrap();
        assert_eq!(targets.len(), 1);
        assert!(matches!(targets[0], Target::Conversation(_)));
        assert_eq!(targets[0].input(), "q0");
        assert_eq!(targets[0].output(), "a2");
    }

    #[test]
    fn test_step_transcript_includes_history() {
        let container = conversation(3);
        let targets = select_targets(&container, 0, MetricScope::Single, &RunPolicy::All).unwrap();
        assert_eq!(
            targets[1].transcript(),
            "User: q0\nAssistant: a0\nUser: q1\nAssistant: a1"
        );
    }

    #[test]
    fn test_policy_validation() {
        assert!(RunPolicy::SelectedItems(vec![0, 1]).validate(2).is_ok());
        assert!(RunPolicy::SelectedItems(vec![2]).validate(2).is_err());
        assert!(RunPolicy::SelectedSteps(vec![99]).validate(2).is_ok());
    }
}
