use std::collections::{BTreeSet, HashMap, VecDeque};

use jobflow_core::{SchedulerError, SchedulerResult};

/// DAG节点，父子关系任选一侧声明即可
pub trait DagNode: Clone {
    fn id(&self) -> &str;
    fn parent_ids(&self) -> &[String];
    fn children_ids(&self) -> &[String];
}

/// 不可变的有向无环图，构建时完成环检测
#[derive(Debug, Clone)]
pub struct Dag<T: DagNode> {
    nodes: HashMap<String, T>,
    parents: HashMap<String, BTreeSet<String>>,
    children: HashMap<String, BTreeSet<String>>,
    roots: Vec<String>,
    topological_order: Vec<String>,
}

impl<T: DagNode> Dag<T> {
    pub fn new(nodes: Vec<T>) -> SchedulerResult<Self> {
        if nodes.is_empty() {
            return Err(SchedulerError::InvalidDag("DAG中没有任何节点".to_string()));
        }

        let mut node_map = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let id = node.id().to_string();
            if node_map.insert(id.clone(), node).is_some() {
                return Err(SchedulerError::InvalidDag(format!("节点ID重复: {id}")));
            }
        }

        let mut parents: HashMap<String, BTreeSet<String>> = node_map
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        let mut children = parents.clone();

        for (id, node) in &node_map {
            for child in node.children_ids() {
                if !node_map.contains_key(child) {
                    return Err(SchedulerError::InvalidDag(format!(
                        "节点 {id} 引用了不存在的子节点 {child}"
                    )));
                }
                Self::link(&mut parents, &mut children, id, child);
            }
            for parent in node.parent_ids() {
                if !node_map.contains_key(parent) {
                    return Err(SchedulerError::InvalidDag(format!(
                        "节点 {id} 引用了不存在的父节点 {parent}"
                    )));
                }
                Self::link(&mut parents, &mut children, parent, id);
            }
        }

        let mut roots: Vec<String> = parents
            .iter()
            .filter(|(_, p)| p.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        roots.sort();

        if roots.is_empty() {
            return Err(SchedulerError::CyclicGraph(
                "没有入度为0的根节点，所有节点都在环上".to_string(),
            ));
        }

        let topological_order = Self::topological_peel(&parents, &children, &roots)?;

        Ok(Self {
            nodes: node_map,
            parents,
            children,
            roots,
            topological_order,
        })
    }

    fn link(
        parents: &mut HashMap<String, BTreeSet<String>>,
        children: &mut HashMap<String, BTreeSet<String>>,
        parent: &str,
        child: &str,
    ) {
        if let Some(set) = children.get_mut(parent) {
            set.insert(child.to_string());
        }
        if let Some(set) = parents.get_mut(child) {
            set.insert(parent.to_string());
        }
    }

    /// 逐层剥离入度为0的节点，剥离不完的节点构成环
    fn topological_peel(
        parents: &HashMap<String, BTreeSet<String>>,
        children: &HashMap<String, BTreeSet<String>>,
        roots: &[String],
    ) -> SchedulerResult<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = parents
            .iter()
            .map(|(id, p)| (id.as_str(), p.len()))
            .collect();
        let mut queue: VecDeque<&str> = roots.iter().map(String::as_str).collect();
        let mut order = Vec::with_capacity(parents.len());

        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            if let Some(subs) = children.get(node) {
                for child in subs {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child.as_str());
                        }
                    }
                }
            }
        }

        if order.len() < parents.len() {
            let mut cyclic: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| *id)
                .collect();
            cyclic.sort_unstable();
            return Err(SchedulerError::CyclicGraph(format!(
                "节点 {} 之间存在环",
                cyclic.join(",")
            )));
        }

        Ok(order)
    }

    pub fn node(&self, id: &str) -> Option<&T> {
        self.nodes.get(id)
    }

    pub fn roots(&self) -> Vec<&T> {
        self.roots.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    /// 直接子节点
    pub fn sub_nodes(&self, id: &str) -> Vec<&T> {
        self.children
            .get(id)
            .map(|subs| subs.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn parent_ids(&self, id: &str) -> Vec<&str> {
        self.parents
            .get(id)
            .map(|p| p.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// 所有父节点都已完成时节点才可触发，根节点总是可触发
    pub fn is_triggerable<F>(&self, id: &str, parent_completed: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        match self.parents.get(id) {
            Some(parents) => parents.iter().all(|p| parent_completed(p)),
            None => false,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.topological_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
    }

    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone)]
    struct Node {
        id: String,
        parents: Vec<String>,
        children: Vec<String>,
    }

    impl DagNode for Node {
        fn id(&self) -> &str {
            &self.id
        }
        fn parent_ids(&self) -> &[String] {
            &self.parents
        }
        fn children_ids(&self) -> &[String] {
            &self.children
        }
    }

    fn node(id: &str, children: &[&str]) -> Node {
        Node {
            id: id.to_string(),
            parents: vec![],
            children: children.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_cycle_without_root() {
        let nodes = vec![node("1", &["2"]), node("2", &["3"]), node("3", &["1"])];
        let err = Dag::new(nodes).unwrap_err();
        assert!(matches!(err, SchedulerError::CyclicGraph(_)));
    }

    #[test]
    fn test_cycle_behind_roots() {
        // 1,2 为根；3 -> 4 -> 3 成环
        let nodes = vec![
            node("1", &["3"]),
            node("2", &["3"]),
            node("3", &["4"]),
            node("4", &["3", "5"]),
            node("5", &[]),
        ];
        let err = Dag::new(nodes).unwrap_err();
        match err {
            SchedulerError::CyclicGraph(msg) => {
                assert!(msg.contains('3'));
                assert!(msg.contains('4'));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let nodes = vec![node("1", &["2"]), node("2", &["2"])];
        assert!(matches!(
            Dag::new(nodes).unwrap_err(),
            SchedulerError::CyclicGraph(_)
        ));
    }

    #[test]
    fn test_normal_dag() {
        let nodes = vec![
            node("1", &["3"]),
            node("2", &["4"]),
            node("3", &["5"]),
            node("4", &["5"]),
            node("5", &[]),
        ];
        let dag = Dag::new(nodes).unwrap();

        let roots: Vec<&str> = dag.roots().iter().map(|n| n.id()).collect();
        assert_eq!(roots, vec!["1", "2"]);

        let subs: Vec<&str> = dag.sub_nodes("1").iter().map(|n| n.id()).collect();
        assert_eq!(subs, vec!["3"]);
        assert_eq!(dag.parent_ids("5"), vec!["3", "4"]);
        assert!(dag.sub_nodes("5").is_empty());
        assert_eq!(dag.len(), 5);

        let done: HashSet<&str> = ["3"].into_iter().collect();
        assert!(!dag.is_triggerable("5", |p| done.contains(p)));
        let done: HashSet<&str> = ["3", "4"].into_iter().collect();
        assert!(dag.is_triggerable("5", |p| done.contains(p)));
        assert!(dag.is_triggerable("1", |_| false));
    }

    #[test]
    fn test_every_node_reachable_from_root() {
        let nodes = vec![
            node("a", &["b", "c"]),
            node("b", &["d"]),
            node("c", &["d"]),
            node("d", &[]),
            node("e", &["d"]),
        ];
        let dag = Dag::new(nodes).unwrap();

        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = dag.roots().iter().map(|n| n.id()).collect();
        while let Some(id) = stack.pop() {
            if seen.insert(id.to_string()) {
                stack.extend(dag.sub_nodes(id).iter().map(|n| n.id()));
            }
        }
        assert_eq!(seen.len(), dag.len());

        let order = dag.topological_order();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("d"));
        assert!(pos("e") < pos("d"));
    }

    #[test]
    fn test_parent_declaration_equivalent_to_children() {
        let nodes = vec![
            node("a", &[]),
            Node {
                id: "b".to_string(),
                parents: vec!["a".to_string()],
                children: vec![],
            },
        ];
        let dag = Dag::new(nodes).unwrap();
        let subs: Vec<&str> = dag.sub_nodes("a").iter().map(|n| n.id()).collect();
        assert_eq!(subs, vec!["b"]);
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let nodes = vec![node("a", &["missing"])];
        assert!(matches!(
            Dag::new(nodes).unwrap_err(),
            SchedulerError::InvalidDag(_)
        ));
        assert!(Dag::<Node>::new(vec![]).is_err());
        assert!(Dag::new(vec![node("a", &[]), node("a", &[])]).is_err());
    }
}
