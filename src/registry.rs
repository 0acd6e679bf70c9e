//! Client-side registry view (§4.1): resolves destinations, classifies local vs. remote,
//! and holds a copy-on-write snapshot of peer [`NodeSpec`]s.

use crate::error::{Error, Result};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use url::Url;

/// One network a node can be reached on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub url: Url,
}

/// name, hosted modules, and reachable networks for one node in the mesh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub modules: BTreeSet<String>,
    pub networks: Vec<Network>,
}

// "Two nodes are identical iff their names match" (§3) — identity is by name alone, not by
// the (possibly stale) set of modules/networks a peer last advertised.
impl PartialEq for NodeSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for NodeSpec {}
impl Hash for NodeSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host_str() {
        Some(host) => host == "localhost" || host == "127.0.0.1" || host == "::1",
        None => false,
    }
}

/// Immutable read of the registry at one point in time; safe to hold across an `.await`.
#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    data: Arc<RegistryData>,
}

#[derive(Debug)]
struct RegistryData {
    current_node: String,
    nodes: HashMap<String, NodeSpec>,
    module_owners: HashMap<String, String>,
    registry_node: Option<NodeSpec>,
}

impl RegistryData {
    fn owner_of_module(&self, module: &str) -> Option<&str> {
        self.module_owners.get(module).map(String::as_str)
    }
}

fn build_module_owners(nodes: &HashMap<String, NodeSpec>) -> Result<HashMap<String, String>> {
    let mut owners = HashMap::new();
    for spec in nodes.values() {
        for module in &spec.modules {
            if let Some(existing) = owners.insert(module.clone(), spec.name.clone()) {
                if existing != spec.name {
                    return Err(Error::DuplicateModuleOwner {
                        module: module.clone(),
                    });
                }
            }
        }
    }
    Ok(owners)
}

impl RegistrySnapshot {
    pub fn current_node(&self) -> &NodeSpec {
        self.data
            .nodes
            .get(&self.data.current_node)
            .expect("current node always present in its own registry")
    }

    pub fn registry_node(&self) -> Option<&NodeSpec> {
        self.data.registry_node.as_ref()
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.data.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.data.nodes.values()
    }

    /// Resolves a message's destination node, filling `dst_node` when absent (§4.1).
    pub fn complete_message(&self, mut msg: Message) -> Result<Message> {
        if msg.dst_node.is_none() {
            let module = msg.dst_module().to_string();
            match self.data.owner_of_module(&module) {
                Some(owner) => msg.dst_node = Some(owner.to_string()),
                None => {
                    // An ask-response addressed back to its asker may legitimately omit
                    // dst_node resolution via module ownership; the caller is expected to
                    // have set dst_node directly when replying. Anything else is a routing
                    // failure.
                    if msg.parent_id.is_none() {
                        return Err(Error::Routing { module });
                    }
                }
            }
        }
        Ok(msg)
    }

    pub fn is_local(&self, msg: &Message) -> bool {
        msg.dst_node.as_deref() == Some(self.data.current_node.as_str())
    }

    /// Picks a URL to reach `node` (§4.1): prefer a network name shared with the local node,
    /// otherwise the first entry. Loopback URLs are only offered when the local node also
    /// advertises a loopback host, so a remote peer is never handed an unreachable
    /// `127.0.0.1` address.
    pub fn choose_url<'a>(&self, node: &'a NodeSpec) -> Option<&'a Url> {
        if node.networks.is_empty() {
            return None;
        }
        let local_network_names: BTreeSet<&str> = self
            .current_node()
            .networks
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        let local_has_loopback = self
            .current_node()
            .networks
            .iter()
            .any(|n| is_loopback_host(&n.url));

        let candidates: Vec<&Network> = node
            .networks
            .iter()
            .filter(|n| local_has_loopback || !is_loopback_host(&n.url))
            .collect();
        let pool = if candidates.is_empty() {
            &node.networks
        } else {
            return candidates
                .iter()
                .find(|n| local_network_names.contains(n.name.as_str()))
                .or_else(|| candidates.first())
                .map(|n| &n.url);
        };
        pool.iter()
            .find(|n| local_network_names.contains(n.name.as_str()))
            .or_else(|| pool.first())
            .map(|n| &n.url)
    }
}

/// Mutable registry held by a node; exposes copy-on-write snapshots to readers.
pub struct Registry {
    inner: parking_lot::RwLock<Arc<RegistryData>>,
}

impl Registry {
    pub fn new(current_node: NodeSpec, registry_node: Option<NodeSpec>) -> Result<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(current_node.name.clone(), current_node.clone());
        let module_owners = build_module_owners(&nodes)?;
        let data = RegistryData {
            current_node: current_node.name,
            nodes,
            module_owners,
            registry_node,
        };
        Ok(Registry {
            inner: parking_lot::RwLock::new(Arc::new(data)),
        })
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            data: self.inner.read().clone(),
        }
    }

    /// Atomically replaces the peer set (§4.1 `update`). Rejects updates that would create
    /// duplicate module owners, leaving the prior snapshot untouched.
    pub fn update(&self, specs: Vec<NodeSpec>) -> Result<()> {
        let mut guard = self.inner.write();
        let current_name = guard.current_node.clone();
        let current_spec = guard
            .nodes
            .get(&current_name)
            .cloned()
            .expect("current node always present");

        let mut nodes: HashMap<String, NodeSpec> = specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        nodes.entry(current_name.clone()).or_insert(current_spec);
        let module_owners = build_module_owners(&nodes)?;

        let new_data = RegistryData {
            current_node: current_name,
            nodes,
            module_owners,
            registry_node: guard.registry_node.clone(),
        };
        *guard = Arc::new(new_data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(name: &str, url: &str) -> Network {
        Network {
            name: name.to_string(),
            url: url.parse().unwrap(),
        }
    }

    fn spec(name: &str, modules: &[&str], networks: Vec<Network>) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            modules: modules.iter().map(|s| s.to_string()).collect(),
            networks,
        }
    }

    #[test]
    fn complete_message_resolves_by_module_owner() {
        let local = spec("a", &["worker"], vec![net("lan", "http://a.local:8000")]);
        let registry = Registry::new(local, None).unwrap();
        registry
            .update(vec![
                spec("a", &["worker"], vec![net("lan", "http://a.local:8000")]),
                spec("b", &["registry"], vec![net("lan", "http://b.local:8000")]),
            ])
            .unwrap();
        let snap = registry.snapshot();
        let msg = Message::new("worker.ping", "registry.query", serde_json::json!({}));
        let resolved = snap.complete_message(msg).unwrap();
        assert_eq!(resolved.dst_node.as_deref(), Some("b"));
    }

    #[test]
    fn complete_message_fails_for_unknown_module() {
        let local = spec("a", &["worker"], vec![]);
        let registry = Registry::new(local, None).unwrap();
        let snap = registry.snapshot();
        let msg = Message::new("worker.ping", "ghost.query", serde_json::json!({}));
        let err = snap.complete_message(msg).unwrap_err();
        assert_eq!(err.kind(), "routing_error");
    }

    #[test]
    fn ask_response_without_owner_is_not_a_routing_error() {
        let local = spec("a", &["worker"], vec![]);
        let registry = Registry::new(local, None).unwrap();
        let snap = registry.snapshot();
        let mut msg = Message::new("worker.ping", "ghost.reply", serde_json::json!({}));
        msg.parent_id = Some(crate::message::MessageId::new());
        let resolved = snap.complete_message(msg).unwrap();
        assert!(resolved.dst_node.is_none());
    }

    #[test]
    fn update_rejects_duplicate_module_owners() {
        let local = spec("a", &["worker"], vec![]);
        let registry = Registry::new(local, None).unwrap();
        let err = registry
            .update(vec![
                spec("b", &["shared"], vec![]),
                spec("c", &["shared"], vec![]),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), "duplicate_module_owner");
        // prior snapshot is untouched
        assert!(registry.snapshot().node("b").is_none());
    }

    #[test]
    fn choose_url_prefers_shared_network_name() {
        let local = spec("a", &["worker"], vec![net("lan", "http://10.0.0.1:9000")]);
        let registry = Registry::new(local, None).unwrap();
        registry
            .update(vec![
                spec(
                    "a",
                    &["worker"],
                    vec![net("lan", "http://10.0.0.1:9000")],
                ),
                spec(
                    "b",
                    &["registry"],
                    vec![net("wan", "http://b.example.com"), net("lan", "http://10.0.0.2:9000")],
                ),
            ])
            .unwrap();
        let snap = registry.snapshot();
        let b = snap.node("b").unwrap();
        let url = snap.choose_url(b).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.2:9000/");
    }

    #[test]
    fn choose_url_never_offers_loopback_to_non_loopback_peer() {
        let local = spec("a", &["worker"], vec![net("lan", "http://10.0.0.1:9000")]);
        let registry = Registry::new(local, None).unwrap();
        registry
            .update(vec![
                spec("a", &["worker"], vec![net("lan", "http://10.0.0.1:9000")]),
                spec(
                    "b",
                    &["registry"],
                    vec![net("dev", "http://127.0.0.1:9001"), net("wan", "http://b.example.com")],
                ),
            ])
            .unwrap();
        let snap = registry.snapshot();
        let b = snap.node("b").unwrap();
        let url = snap.choose_url(b).unwrap();
        assert_eq!(url.host_str(), Some("b.example.com"));
    }
}
