//! Topology documents: node and relationship templates that `load` turns
//! into a blueprint, a deployment and their instances.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use topograph_core::model::{
    Blueprint, Deployment, Node, NodeInstance, OperationSpec, Operations, Relationship,
    RelationshipInstance,
};
use topograph_core::storage::{ModelStore, ModelStoreExt};
use topograph_core::types::Inputs;
use topograph_core::workflow::WorkflowRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub nodes: Vec<NodeTemplate>,
    #[serde(default)]
    pub relationships: Vec<RelationshipTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub properties: Inputs,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationBinding>,
}

fn default_instances() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipTemplate {
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default = "default_relationship_type")]
    pub type_name: String,
    #[serde(default)]
    pub source_operations: BTreeMap<String, OperationBinding>,
    #[serde(default)]
    pub target_operations: BTreeMap<String, OperationBinding>,
}

fn default_relationship_type() -> String {
    "tosca.relationships.DependsOn".to_string()
}

/// An implementation name, or an implementation with default inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationBinding {
    Implementation(String),
    Spec(OperationSpec),
}

fn operations(bindings: &BTreeMap<String, OperationBinding>) -> Operations {
    bindings
        .iter()
        .map(|(name, binding)| {
            let spec = match binding {
                OperationBinding::Implementation(implementation) => {
                    OperationSpec::new(implementation.clone())
                }
                OperationBinding::Spec(spec) => spec.clone(),
            };
            (name.clone(), spec)
        })
        .collect()
}

/// What `load` created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub deployment_id: String,
    pub nodes: usize,
    pub node_instances: usize,
    pub relationship_instances: usize,
}

impl TopologyDocument {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology document {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse topology document {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                bail!("node with an empty name");
            }
            if node.instances == 0 {
                bail!("node '{}' must have at least one instance", node.name);
            }
            if !seen.insert(node.name.as_str()) {
                bail!("node '{}' is declared twice", node.name);
            }
        }

        let mut pairs = HashSet::new();
        for rel in &self.relationships {
            for end in [&rel.source, &rel.target] {
                if !seen.contains(end.as_str()) {
                    bail!("relationship refers to unknown node '{}'", end);
                }
            }
            if rel.source == rel.target {
                bail!("node '{}' cannot have a relationship to itself", rel.source);
            }
            if !pairs.insert((rel.source.as_str(), rel.target.as_str())) {
                bail!(
                    "relationship from '{}' to '{}' is declared twice",
                    rel.source,
                    rel.target
                );
            }
        }
        Ok(())
    }

    /// Create the deployment and its instances in the model store.
    ///
    /// Node `n` gets instances `n_1..n_k`. Relationship instances link the
    /// i-th source instance to target instance `i mod k`.
    pub fn load(
        &self,
        store: &dyn ModelStore,
        deployment_id: &str,
        registry: &WorkflowRegistry,
    ) -> Result<LoadSummary> {
        self.validate()?;

        for node in &self.nodes {
            if let Some(existing) = store.find::<Node>(&node.name)? {
                if existing.deployment_id != deployment_id {
                    bail!(
                        "node '{}' already belongs to deployment '{}'",
                        node.name,
                        existing.deployment_id
                    );
                }
            }
        }

        let now = Utc::now();
        store.put(&Blueprint {
            id: self.name.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            main_file_name: format!("{}.json", self.name),
            created_at: now,
        })?;
        store.put(&Deployment {
            id: deployment_id.to_string(),
            name: format!("{}_{}", self.name, deployment_id),
            blueprint_id: self.name.clone(),
            description: self.description.clone(),
            workflows: registry.declarations(),
            inputs: self.inputs.clone(),
            created_at: now,
        })?;

        let mut instances: HashMap<&str, Vec<String>> = HashMap::new();
        for template in &self.nodes {
            store.put(&Node {
                id: template.name.clone(),
                name: template.name.clone(),
                deployment_id: deployment_id.to_string(),
                type_name: template.type_name.clone(),
                operations: operations(&template.operations),
                properties: template.properties.clone(),
                number_of_instances: template.instances,
            })?;

            let ids = instances.entry(template.name.as_str()).or_default();
            for index in 1..=template.instances {
                let id = format!("{}_{}", template.name, index);
                store.put(&NodeInstance {
                    id: id.clone(),
                    name: id.clone(),
                    node_id: template.name.clone(),
                    deployment_id: deployment_id.to_string(),
                    state: String::new(),
                    runtime_properties: Inputs::new(),
                })?;
                ids.push(id);
            }
        }

        let mut relationship_instances = 0;
        for template in &self.relationships {
            let rel_id = format!("{}-to-{}", template.source, template.target);
            store.put(&Relationship {
                id: rel_id.clone(),
                name: rel_id.clone(),
                source_node_id: template.source.clone(),
                target_node_id: template.target.clone(),
                type_name: template.type_name.clone(),
                source_operations: operations(&template.source_operations),
                target_operations: operations(&template.target_operations),
            })?;

            let sources = instances.get(template.source.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let targets = instances.get(template.target.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            if targets.is_empty() {
                continue;
            }
            for (index, source) in sources.iter().enumerate() {
                let id = format!("{}_{}", rel_id, index + 1);
                store.put(&RelationshipInstance {
                    id: id.clone(),
                    name: id,
                    relationship_id: rel_id.clone(),
                    source_node_instance_id: source.clone(),
                    target_node_instance_id: targets[index % targets.len()].clone(),
                })?;
                relationship_instances += 1;
            }
        }

        let summary = LoadSummary {
            deployment_id: deployment_id.to_string(),
            nodes: self.nodes.len(),
            node_instances: instances.values().map(Vec::len).sum(),
            relationship_instances,
        };
        tracing::info!(
            "Loaded deployment {}: {} nodes, {} node instances, {} relationship instances",
            summary.deployment_id,
            summary.nodes,
            summary.node_instances,
            summary.relationship_instances
        );
        Ok(summary)
    }
}
