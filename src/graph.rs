//! Link dependency graph over the containers of one session and the orders derived from it.
//!
//! An edge `a -> b` means `a` links to `b`. Containers are started dependencies first
//! and stopped in exactly the reverse order.
use crate::container::Container;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResolvedOrder {
    Total(Vec<String>),
    /// The graph has cycles. Members of a cycle are ordered by name among each other,
    /// everything else still respects the links.
    Degraded {
        order: Vec<String>,
        cycle_members: BTreeSet<String>,
    },
}

impl ResolvedOrder {
    pub fn names(&self) -> &[String] {
        match self {
            ResolvedOrder::Total(order) => order,
            ResolvedOrder::Degraded { order, .. } => order,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ResolvedOrder::Degraded { .. })
    }

    pub fn cycle_members(&self) -> Option<&BTreeSet<String>> {
        match self {
            ResolvedOrder::Total(_) => None,
            ResolvedOrder::Degraded { cycle_members, .. } => Some(cycle_members),
        }
    }

    pub fn reversed(&self) -> Self {
        fn reverse(order: &[String]) -> Vec<String> {
            order.iter().rev().cloned().collect()
        }
        match self {
            ResolvedOrder::Total(order) => ResolvedOrder::Total(reverse(order)),
            ResolvedOrder::Degraded {
                order,
                cycle_members,
            } => ResolvedOrder::Degraded {
                order: reverse(order),
                cycle_members: cycle_members.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Links to containers outside of `nodes` do not constrain anything and are dropped.
    pub fn new<N, D>(nodes: impl IntoIterator<Item = (N, D)>) -> Self
    where
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let declared: Vec<(String, Vec<String>)> = nodes
            .into_iter()
            .map(|(name, deps)| (name.into(), deps.into_iter().map(Into::into).collect()))
            .collect();
        let known: HashSet<&str> = declared.iter().map(|(name, _)| name.as_str()).collect();
        let dependencies = declared
            .iter()
            .map(|(name, deps)| {
                let deps = deps
                    .iter()
                    .filter(|dep| known.contains(dep.as_str()))
                    .cloned()
                    .collect();
                (name.clone(), deps)
            })
            .collect();
        Self { dependencies }
    }

    pub fn build(containers: &[Container]) -> Self {
        Self::new(
            containers
                .iter()
                .map(|container| (container.name(), container.dependencies())),
        )
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn dependents(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .filter(move |(_, deps)| deps.contains(name))
            .map(|(dependent, _)| dependent.as_str())
    }

    /// Everything that directly or transitively links to one of `names`, excluding `names`.
    pub fn downstream<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let roots: BTreeSet<&str> = names.into_iter().collect();
        let mut seen: BTreeSet<&str> = roots.clone();
        let mut queue: Vec<&str> = roots.iter().copied().collect();
        while let Some(name) = queue.pop() {
            for dependent in self.dependents(name) {
                if seen.insert(dependent) {
                    queue.push(dependent);
                }
            }
        }
        seen.into_iter()
            .filter(|name| !roots.contains(name))
            .map(str::to_string)
            .collect()
    }

    /// Dependencies first. Cycles are collapsed into one step ordered by name.
    pub fn start_order(&self) -> ResolvedOrder {
        let components = self.strongly_connected();
        let mut component_of: HashMap<&str, usize> = HashMap::new();
        for (index, members) in components.iter().enumerate() {
            for member in members {
                component_of.insert(*member, index);
            }
        }

        let mut pending = vec![0usize; components.len()];
        let mut unlocks: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        let mut cycle_members = BTreeSet::new();
        for (index, members) in components.iter().enumerate() {
            let mut requires = BTreeSet::new();
            for member in members {
                for dep in self.dependencies(member) {
                    let target = component_of[dep];
                    if target == index {
                        continue;
                    }
                    requires.insert(target);
                }
            }
            pending[index] = requires.len();
            for target in requires {
                unlocks[target].insert(index);
            }
            let self_linked = members
                .iter()
                .any(|member| self.dependencies(member).any(|dep| dep == *member));
            if members.len() > 1 || self_linked {
                cycle_members.extend(members.iter().map(|member| member.to_string()));
            }
        }

        // members are sorted, so the first one is the smallest name of the component
        let mut ready: BTreeSet<(&str, usize)> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| (components[index][0], index))
            .collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some((_, index)) = ready.pop_first() {
            order.extend(components[index].iter().map(|member| member.to_string()));
            for &next in &unlocks[index] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.insert((components[next][0], next));
                }
            }
        }

        if cycle_members.is_empty() {
            ResolvedOrder::Total(order)
        } else {
            ResolvedOrder::Degraded {
                order,
                cycle_members,
            }
        }
    }

    pub fn stop_order(&self) -> ResolvedOrder {
        self.start_order().reversed()
    }

    /// Weakly connected parts of the graph, each listed in start order.
    ///
    /// No link crosses two parts, so they can be updated independently.
    pub fn components(&self) -> Vec<Vec<String>> {
        let names: Vec<&str> = self.dependencies.keys().map(String::as_str).collect();
        let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut parent: Vec<usize> = (0..names.len()).collect();

        fn root(parent: &mut [usize], mut node: usize) -> usize {
            while parent[node] != node {
                parent[node] = parent[parent[node]];
                node = parent[node];
            }
            node
        }

        for (name, deps) in &self.dependencies {
            for dep in deps {
                let a = root(&mut parent, index[name.as_str()]);
                let b = root(&mut parent, index[dep.as_str()]);
                parent[a] = b;
            }
        }

        let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<String>> = Vec::new();
        for name in self.start_order().names() {
            let r = root(&mut parent, index[name.as_str()]);
            let slot = *slot_of_root.entry(r).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(name.clone());
        }
        components
    }

    /// Tarjan's algorithm. Every component comes back with its members sorted by name.
    fn strongly_connected(&self) -> Vec<Vec<&str>> {
        struct Tarjan<'g> {
            graph: &'g DependencyGraph,
            next_index: usize,
            index: HashMap<&'g str, usize>,
            lowlink: HashMap<&'g str, usize>,
            stack: Vec<&'g str>,
            on_stack: HashSet<&'g str>,
            components: Vec<Vec<&'g str>>,
        }

        impl<'g> Tarjan<'g> {
            fn visit(&mut self, node: &'g str) {
                self.index.insert(node, self.next_index);
                self.lowlink.insert(node, self.next_index);
                self.next_index += 1;
                self.stack.push(node);
                self.on_stack.insert(node);

                let graph = self.graph;
                for dep in graph.dependencies(node) {
                    if !self.index.contains_key(dep) {
                        self.visit(dep);
                        let low = self.lowlink[node].min(self.lowlink[dep]);
                        self.lowlink.insert(node, low);
                    } else if self.on_stack.contains(dep) {
                        let low = self.lowlink[node].min(self.index[dep]);
                        self.lowlink.insert(node, low);
                    }
                }

                if self.lowlink[node] == self.index[node] {
                    let mut members = Vec::new();
                    while let Some(member) = self.stack.pop() {
                        self.on_stack.remove(member);
                        members.push(member);
                        if member == node {
                            break;
                        }
                    }
                    members.sort_unstable();
                    self.components.push(members);
                }
            }
        }

        let mut tarjan = Tarjan {
            graph: self,
            next_index: 0,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            stack: Vec::new(),
            on_stack: HashSet::new(),
            components: Vec::new(),
        };
        for node in self.dependencies.keys() {
            if !tarjan.index.contains_key(node.as_str()) {
                tarjan.visit(node);
            }
        }
        tarjan.components
    }
}
