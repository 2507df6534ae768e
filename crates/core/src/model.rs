//! Records kept in the model store and a read-only topology view over them.

use crate::error::StoreError;
use crate::storage::{ModelStore, ModelStoreExt};
use crate::types::Inputs;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Entity collections held by a model store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Blueprint,
    Deployment,
    Node,
    NodeInstance,
    Relationship,
    RelationshipInstance,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Blueprint,
        Collection::Deployment,
        Collection::Node,
        Collection::NodeInstance,
        Collection::Relationship,
        Collection::RelationshipInstance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blueprint => "blueprint",
            Self::Deployment => "deployment",
            Self::Node => "node",
            Self::NodeInstance => "node_instance",
            Self::Relationship => "relationship",
            Self::RelationshipInstance => "relationship_instance",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record addressable by id and name within its collection
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub main_file_name: String,
    pub created_at: DateTime<Utc>,
}

/// Declared parameter of a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDeclaration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parameters without a default are mandatory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ParameterDeclaration {
    pub fn required(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            default: None,
        }
    }

    pub fn optional(description: impl Into<String>, default: serde_json::Value) -> Self {
        Self {
            description: Some(description.into()),
            default: Some(default),
        }
    }
}

/// A workflow exposed by a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDeclaration {
    /// Name of the workflow in the workflow registry
    pub handler: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub blueprint_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowDeclaration>,
    #[serde(default)]
    pub inputs: Inputs,
    pub created_at: DateTime<Utc>,
}

/// Binding of an interface operation name to an implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub implementation: String,
    #[serde(default)]
    pub inputs: Inputs,
}

impl OperationSpec {
    pub fn new(implementation: impl Into<String>) -> Self {
        Self {
            implementation: implementation.into(),
            inputs: Inputs::new(),
        }
    }
}

pub type Operations = BTreeMap<String, OperationSpec>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub deployment_id: String,
    pub type_name: String,
    #[serde(default)]
    pub operations: Operations,
    #[serde(default)]
    pub properties: Inputs,
    pub number_of_instances: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub deployment_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub runtime_properties: Inputs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub name: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub type_name: String,
    #[serde(default)]
    pub source_operations: Operations,
    #[serde(default)]
    pub target_operations: Operations,
}

impl Relationship {
    /// Operations declared on one end of the relationship
    pub fn operations(&self, end: crate::types::RelationshipEnd) -> &Operations {
        match end {
            crate::types::RelationshipEnd::Source => &self.source_operations,
            crate::types::RelationshipEnd::Target => &self.target_operations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipInstance {
    pub id: String,
    pub name: String,
    pub relationship_id: String,
    pub source_node_instance_id: String,
    pub target_node_instance_id: String,
}

macro_rules! entity {
    ($ty:ty, $collection:expr) => {
        impl Entity for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &str {
                &self.id
            }

            fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

entity!(Blueprint, Collection::Blueprint);
entity!(Deployment, Collection::Deployment);
entity!(Node, Collection::Node);
entity!(NodeInstance, Collection::NodeInstance);
entity!(Relationship, Collection::Relationship);
entity!(RelationshipInstance, Collection::RelationshipInstance);

/// Read-only view of one deployment's instances and relationships
#[derive(Debug, Clone)]
pub struct Topology {
    deployment: Deployment,
    nodes: HashMap<String, Node>,
    instances: Vec<NodeInstance>,
    relationships: HashMap<String, Relationship>,
    outbound: HashMap<String, Vec<RelationshipInstance>>,
}

impl Topology {
    /// Load the topology of a deployment from the model store
    pub fn load(store: &dyn ModelStore, deployment_id: &str) -> Result<Self, StoreError> {
        let deployment: Deployment = store.get(deployment_id)?;

        let nodes: HashMap<String, Node> = store
            .iter::<Node>()?
            .into_iter()
            .filter(|n| n.deployment_id == deployment_id)
            .map(|n| (n.id.clone(), n))
            .collect();

        let instances: Vec<NodeInstance> = store
            .iter::<NodeInstance>()?
            .into_iter()
            .filter(|i| i.deployment_id == deployment_id)
            .collect();

        let relationships: HashMap<String, Relationship> = store
            .iter::<Relationship>()?
            .into_iter()
            .filter(|r| nodes.contains_key(&r.source_node_id))
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut outbound: HashMap<String, Vec<RelationshipInstance>> = HashMap::new();
        for ri in store.iter::<RelationshipInstance>()? {
            if relationships.contains_key(&ri.relationship_id) {
                outbound
                    .entry(ri.source_node_instance_id.clone())
                    .or_default()
                    .push(ri);
            }
        }

        Ok(Self {
            deployment,
            nodes,
            instances,
            relationships,
            outbound,
        })
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Node instances ordered by id
    pub fn node_instances(&self) -> &[NodeInstance] {
        &self.instances
    }

    pub fn node_instance(&self, id: &str) -> Option<&NodeInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Node template of an instance
    pub fn node_of(&self, instance: &NodeInstance) -> Option<&Node> {
        self.nodes.get(&instance.node_id)
    }

    pub fn relationship(&self, id: &str) -> Option<&Relationship> {
        self.relationships.get(id)
    }

    /// Relationship instances whose source is the given node instance
    pub fn outbound(&self, instance_id: &str) -> &[RelationshipInstance] {
        self.outbound
            .get(instance_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ids of the node instances the given instance has relationships to
    pub fn outbound_targets(&self, instance_id: &str) -> Vec<&str> {
        self.outbound(instance_id)
            .iter()
            .map(|ri| ri.target_node_instance_id.as_str())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Small in-memory topologies shared by tests across the crate.

    use super::*;
    use crate::storage::MemoryModelStore;
    use std::sync::Arc;

    pub const DEPLOYMENT: &str = "dep-1";

    pub fn store() -> Arc<MemoryModelStore> {
        let store = Arc::new(MemoryModelStore::new());
        store
            .put(&Blueprint {
                id: "bp-1".to_string(),
                name: "blueprint".to_string(),
                description: String::new(),
                main_file_name: "topology.json".to_string(),
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .put(&Deployment {
                id: DEPLOYMENT.to_string(),
                name: "blueprint_dep-1".to_string(),
                blueprint_id: "bp-1".to_string(),
                description: String::new(),
                workflows: BTreeMap::new(),
                inputs: Inputs::new(),
                created_at: Utc::now(),
            })
            .unwrap();
        store
    }

    /// Add a node with one instance named after it
    pub fn add_node(store: &MemoryModelStore, name: &str, operations: &[(&str, &str)]) {
        let node = Node {
            id: name.to_string(),
            name: name.to_string(),
            deployment_id: DEPLOYMENT.to_string(),
            type_name: format!("test.{name}"),
            operations: operations
                .iter()
                .map(|(op, implementation)| (op.to_string(), OperationSpec::new(*implementation)))
                .collect(),
            properties: Inputs::new(),
            number_of_instances: 1,
        };
        store.put(&node).unwrap();
        store
            .put(&NodeInstance {
                id: format!("{name}_1"),
                name: format!("{name}_1"),
                node_id: name.to_string(),
                deployment_id: DEPLOYMENT.to_string(),
                state: String::new(),
                runtime_properties: Inputs::new(),
            })
            .unwrap();
    }

    /// Connect `source` to `target` (source depends on target)
    pub fn connect(
        store: &MemoryModelStore,
        source: &str,
        target: &str,
        source_operations: &[(&str, &str)],
        target_operations: &[(&str, &str)],
    ) {
        let to_ops = |ops: &[(&str, &str)]| -> Operations {
            ops.iter()
                .map(|(op, implementation)| (op.to_string(), OperationSpec::new(*implementation)))
                .collect()
        };
        let rel_id = format!("{source}-to-{target}");
        store
            .put(&Relationship {
                id: rel_id.clone(),
                name: rel_id.clone(),
                source_node_id: source.to_string(),
                target_node_id: target.to_string(),
                type_name: "test.HostedOn".to_string(),
                source_operations: to_ops(source_operations),
                target_operations: to_ops(target_operations),
            })
            .unwrap();
        store
            .put(&RelationshipInstance {
                id: format!("{rel_id}_1"),
                name: format!("{rel_id}_1"),
                relationship_id: rel_id,
                source_node_instance_id: format!("{source}_1"),
                target_node_instance_id: format!("{target}_1"),
            })
            .unwrap();
    }
}
