use crate::cancel::CancelToken;
use crate::config::{Config, PKG_PORT_ORIGIN};
use crate::error::Error;
use crate::logger::Logger;
use crate::port::{DepKind, Port, PortFlags, PortId, PortRegistry, BuildStateRegistry};
use crate::resolver::{parse_dep_tokens, Resolver};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// An ordered dependency edge; `from` requires `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: PortId,
    pub to: PortId,
    pub kind: DepKind,
}

#[derive(Debug, Default)]
struct PortLinks {
    /// Outgoing edges: prerequisites of this port.
    depends_on: Vec<Edge>,
    /// Incoming edges: ports that depend on this one.
    dependents: Vec<Edge>,
    /// Longest reverse-reachable chain of dependents; 0 for leaves.
    depi_depth: u32,
}

/// How an incomplete topological order is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    /// A cycle aborts with `ErrCycleDetected`.
    Strict,
    /// A cycle yields the partial order.
    Lenient,
}

/// Adjacency for every registered port. Ports stay immutable; both halves
/// of every edge are inserted by the single `link` routine, which keeps the
/// bidirectional invariant local to one function.
#[derive(Default)]
pub struct DependencyGraph {
    links: HashMap<String, PortLinks>,
}

impl DependencyGraph {
    pub fn depends_on(&self, id: &PortId) -> &[Edge] {
        self.links
            .get(&id.key())
            .map(|links| links.depends_on.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents(&self, id: &PortId) -> &[Edge] {
        self.links
            .get(&id.key())
            .map(|links| links.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Number of immediate dependents.
    pub fn depi_count(&self, id: &PortId) -> usize {
        self.dependents(id).len()
    }

    pub fn depi_depth(&self, id: &PortId) -> u32 {
        self.links
            .get(&id.key())
            .map(|links| links.depi_depth)
            .unwrap_or(0)
    }

    fn link(&mut self, from: &PortId, to: &PortId, kind: DepKind) {
        let edge = Edge {
            from: from.clone(),
            to: to.clone(),
            kind,
        };
        let out = self.links.entry(from.key()).or_default();
        if out.depends_on.contains(&edge) {
            return;
        }
        out.depends_on.push(edge.clone());
        self.links.entry(to.key()).or_default().dependents.push(edge);
    }
}

/// Discovery pass: starting from the seeds, parse each port's six
/// dependency strings and resolve every unknown reference until the
/// registry is closed under dependencies.
pub fn resolve_closure(
    cancel: &CancelToken,
    cfg: &Config,
    resolver: &Resolver,
    seeds: &[Arc<Port>],
    registry: &PortRegistry,
    states: &BuildStateRegistry,
    logger: &dyn Logger,
) -> Result<Vec<Arc<Port>>, Error> {
    let mut frontier: Vec<Arc<Port>> = seeds.to_vec();
    while !frontier.is_empty() {
        cancel.check("dependency discovery")?;
        let mut unknown: Vec<PortId> = Vec::new();
        for port in &frontier {
            for kind in DepKind::ALL {
                for dep in parse_dep_tokens(port.deps.get(kind), &cfg.dports_path) {
                    if !registry.contains(&dep) && !unknown.contains(&dep) {
                        unknown.push(dep);
                    }
                }
            }
        }
        if unknown.is_empty() {
            break;
        }
        logger.debug(&format!(
            "phase=discovery status=expanding unknown={}",
            unknown.len()
        ));
        let outcome = resolver.resolve_deps(cancel, cfg, &unknown, registry, states, logger)?;
        for failure in &outcome.failures {
            logger.warn(&format!(
                "phase=discovery status=dep-failed port={} reason={}",
                failure.spec, failure.error
            ));
        }
        frontier = outcome.ports;
    }
    Ok(registry.all())
}

/// Linking pass: add both halves of every parsed dependency edge, coalesce
/// duplicates, flag `ports-mgmt/pkg`, and compute dependent depths.
pub fn link_graph(
    cfg: &Config,
    registry: &PortRegistry,
    states: &BuildStateRegistry,
    logger: &dyn Logger,
) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    let ports = registry.all();
    for port in &ports {
        graph.links.entry(port.id.key()).or_default();
        if port.id.origin() == PKG_PORT_ORIGIN {
            states.add_flags(&port.id, PortFlags::PKG_PKG);
            logger.info(&format!("phase=link status=pkg-port port={}", port.id));
        }
        for kind in DepKind::ALL {
            for dep in parse_dep_tokens(port.deps.get(kind), &cfg.dports_path) {
                if dep == port.id {
                    continue;
                }
                if !registry.contains(&dep) {
                    logger.warn(&format!(
                        "phase=link status=unresolved from={} to={dep}",
                        port.id
                    ));
                    continue;
                }
                graph.link(&port.id, &dep, kind);
            }
        }
    }
    compute_depths(&mut graph, &ports);
    graph
}

fn compute_depths(graph: &mut DependencyGraph, ports: &[Arc<Port>]) {
    fn depth_of(
        graph: &DependencyGraph,
        key: &PortId,
        memo: &mut HashMap<String, u32>,
        visiting: &mut HashSet<String>,
    ) -> u32 {
        if let Some(depth) = memo.get(&key.key()) {
            return *depth;
        }
        if !visiting.insert(key.key()) {
            // Cycle; depth along this path is cut off here.
            return 0;
        }
        let mut depth = 0;
        for edge in graph.dependents(key).to_vec() {
            depth = depth.max(1 + depth_of(graph, &edge.from, memo, visiting));
        }
        visiting.remove(&key.key());
        memo.insert(key.key(), depth);
        depth
    }

    let mut memo = HashMap::new();
    for port in ports {
        let mut visiting = HashSet::new();
        let depth = depth_of(graph, &port.id, &mut memo, &mut visiting);
        if let Some(links) = graph.links.get_mut(&port.id.key()) {
            links.depi_depth = depth;
        }
    }
}

/// Kahn's algorithm over the whole registry. Ties among ready ports break
/// by descending dependent depth, then ascending origin.
pub fn topo_order(
    graph: &DependencyGraph,
    registry: &PortRegistry,
    mode: OrderMode,
) -> Result<Vec<Arc<Port>>, Error> {
    let ports = registry.all();
    let by_key: HashMap<String, Arc<Port>> = ports
        .iter()
        .map(|port| (port.id.key(), Arc::clone(port)))
        .collect();
    let mut indegree: HashMap<String, usize> = ports
        .iter()
        .map(|port| (port.id.key(), graph.depends_on(&port.id).len()))
        .collect();

    let mut ready: Vec<Arc<Port>> = ports
        .iter()
        .filter(|port| indegree[&port.id.key()] == 0)
        .cloned()
        .collect();
    let mut order = Vec::with_capacity(ports.len());

    while !ready.is_empty() {
        ready.sort_by(|a, b| {
            graph
                .depi_depth(&b.id)
                .cmp(&graph.depi_depth(&a.id))
                .then_with(|| a.id.cmp(&b.id))
        });
        let port = ready.remove(0);
        for edge in graph.dependents(&port.id) {
            let Some(entry) = indegree.get_mut(&edge.from.key()) else {
                continue;
            };
            let crossed_zero = *entry == 1;
            *entry = entry.saturating_sub(1);
            if crossed_zero
                && let Some(dependent) = by_key.get(&edge.from.key())
            {
                ready.push(Arc::clone(dependent));
            }
        }
        order.push(port);
    }

    if order.len() < ports.len() {
        let mut remaining: Vec<String> = indegree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(key, _)| key.clone())
            .collect();
        remaining.sort();
        match mode {
            OrderMode::Strict => return Err(Error::CycleDetected { remaining }),
            OrderMode::Lenient => {}
        }
    }
    Ok(order)
}
