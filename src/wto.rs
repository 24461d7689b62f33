//! Weak topological ordering.
//!
//! Bourdoncle's hierarchical decomposition of a graph into nested cycles
//! ("Efficient chaotic iteration strategies with widenings", 1993). The
//! recursive algorithm is run with an explicit task stack so that long
//! straight-line programs do not exhaust the call stack.

use std::collections::BTreeMap;
use std::fmt;

use crate::cfg::Cfg;
use crate::label::Label;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WtoComponent {
    Vertex(Label),
    Cycle(WtoCycle),
}

/// A strongly connected part of the graph, entered through `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WtoCycle {
    pub head: Label,
    /// The body, excluding the head, in iteration order.
    pub components: Vec<WtoComponent>,
}

#[derive(Debug, Clone)]
pub struct Wto {
    components: Vec<WtoComponent>,
    nesting: BTreeMap<Label, Vec<Label>>,
}

impl Wto {
    pub fn new(cfg: &Cfg) -> Self {
        let components = Builder::new(cfg).run();
        let mut nesting = BTreeMap::new();
        collect_nesting(&components, &mut Vec::new(), &mut nesting);
        Wto { components, nesting }
    }

    pub fn components(&self) -> &[WtoComponent] {
        &self.components
    }

    /// Heads of the cycles containing `label`, outermost first. A head is
    /// part of its own cycle.
    pub fn nesting(&self, label: &Label) -> &[Label] {
        self.nesting.get(label).map_or(&[], Vec::as_slice)
    }

    /// Whether `label` belongs to the cycle headed by `head`.
    pub fn in_cycle(&self, label: &Label, head: &Label) -> bool {
        self.nesting(label).contains(head)
    }

    /// Every cycle head, outer cycles before the cycles they contain.
    pub fn loop_heads(&self) -> Vec<Label> {
        fn walk(components: &[WtoComponent], heads: &mut Vec<Label>) {
            for c in components {
                if let WtoComponent::Cycle(cycle) = c {
                    heads.push(cycle.head.clone());
                    walk(&cycle.components, heads);
                }
            }
        }
        let mut heads = Vec::new();
        walk(&self.components, &mut heads);
        heads
    }
}

fn collect_nesting(components: &[WtoComponent], heads: &mut Vec<Label>, out: &mut BTreeMap<Label, Vec<Label>>) {
    for c in components {
        match c {
            WtoComponent::Vertex(label) => {
                out.insert(label.clone(), heads.clone());
            }
            WtoComponent::Cycle(cycle) => {
                heads.push(cycle.head.clone());
                out.insert(cycle.head.clone(), heads.clone());
                collect_nesting(&cycle.components, heads, out);
                heads.pop();
            }
        }
    }
}

impl fmt::Display for WtoComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WtoComponent::Vertex(label) => write!(f, "{}", label),
            WtoComponent::Cycle(cycle) => {
                write!(f, "( {}", cycle.head)?;
                for c in &cycle.components {
                    write!(f, " {}", c)?;
                }
                write!(f, " )")
            }
        }
    }
}

impl fmt::Display for Wto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(" "))
    }
}

const DONE: u32 = u32::MAX;
const TOP_LEVEL: usize = 0;

/// A component under construction. Cycles refer to their partition.
#[derive(Debug)]
enum Slot {
    Vertex(Label),
    Cycle(usize),
}

#[derive(Debug)]
enum Task {
    PushSuccessors { vertex: Label, partition: usize },
    StartVisit { vertex: Label, partition: usize },
    ContinueVisit { vertex: Label, partition: usize, cycle: usize },
}

struct Builder<'a> {
    cfg: &'a Cfg,
    dfn: BTreeMap<Label, u32>,
    head_dfn: BTreeMap<Label, u32>,
    num: u32,
    stack: Vec<Label>,
    /// Components of every partition, in reverse order. Partition 0 is the
    /// top level; every other one is the body of a cycle.
    partitions: Vec<Vec<Slot>>,
    tasks: Vec<Task>,
}

impl<'a> Builder<'a> {
    fn new(cfg: &'a Cfg) -> Self {
        Builder {
            cfg,
            dfn: cfg.labels().map(|l| (l.clone(), 0)).collect(),
            head_dfn: BTreeMap::new(),
            num: 0,
            stack: Vec::new(),
            partitions: vec![Vec::new()],
            tasks: Vec::new(),
        }
    }

    fn dfn(&self, v: &Label) -> u32 {
        self.dfn.get(v).copied().unwrap_or(0)
    }

    fn head_dfn(&self, v: &Label) -> u32 {
        self.head_dfn.get(v).copied().unwrap_or(0)
    }

    fn run(mut self) -> Vec<WtoComponent> {
        self.tasks.push(Task::PushSuccessors {
            vertex: self.cfg.entry_label(),
            partition: TOP_LEVEL,
        });
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::PushSuccessors { vertex, partition } => self.push_successors(vertex, partition),
                Task::StartVisit { vertex, partition } => self.start_visit(vertex, partition),
                Task::ContinueVisit {
                    vertex,
                    partition,
                    cycle,
                } => {
                    self.partitions[cycle].push(Slot::Vertex(vertex));
                    self.partitions[partition].push(Slot::Cycle(cycle));
                }
            }
        }
        self.finish(TOP_LEVEL)
    }

    fn push_successors(&mut self, vertex: Label, partition: usize) {
        if self.dfn(&vertex) != 0 {
            // Reached again along another path.
            return;
        }
        self.num += 1;
        self.dfn.insert(vertex.clone(), self.num);
        self.stack.push(vertex.clone());
        // Runs once every successor below has been handled.
        self.tasks.push(Task::StartVisit {
            vertex: vertex.clone(),
            partition,
        });
        // Successors are pushed in reverse so that they are visited in order.
        for succ in self.cfg.children(&vertex).rev() {
            if self.dfn(succ) == 0 {
                self.tasks.push(Task::PushSuccessors {
                    vertex: succ.clone(),
                    partition,
                });
            }
        }
    }

    fn start_visit(&mut self, vertex: Label, partition: usize) {
        let vertex_dfn = self.dfn(&vertex);
        let mut head = vertex_dfn;
        let mut is_loop = false;
        for succ in self.cfg.children(&vertex) {
            let min = if self.head_dfn(succ) != 0 && self.dfn(succ) != DONE {
                self.head_dfn(succ)
            } else {
                self.dfn(succ)
            };
            if min <= head {
                head = min;
                is_loop = true;
            }
        }

        if head == vertex_dfn {
            self.dfn.insert(vertex.clone(), DONE);
            let mut element = self.stack.pop();
            if is_loop {
                // Everything above the head on the stack belongs to its cycle
                // and is visited again as part of it.
                while let Some(e) = element.filter(|e| *e != vertex) {
                    self.dfn.insert(e.clone(), 0);
                    self.head_dfn.insert(e, 0);
                    element = self.stack.pop();
                }
                self.head_dfn.insert(vertex.clone(), head);
                let cycle = self.partitions.len();
                self.partitions.push(Vec::new());
                self.tasks.push(Task::ContinueVisit {
                    vertex: vertex.clone(),
                    partition,
                    cycle,
                });
                for succ in self.cfg.children(&vertex).rev() {
                    if self.dfn(succ) == 0 {
                        self.tasks.push(Task::PushSuccessors {
                            vertex: succ.clone(),
                            partition: cycle,
                        });
                    }
                }
                return;
            }
            self.partitions[partition].push(Slot::Vertex(vertex.clone()));
        }
        self.head_dfn.insert(vertex, head);
    }

    /// Turns a partition into components in iteration order.
    fn finish(&mut self, partition: usize) -> Vec<WtoComponent> {
        let slots = std::mem::take(&mut self.partitions[partition]);
        let mut components = Vec::with_capacity(slots.len());
        for slot in slots.into_iter().rev() {
            match slot {
                Slot::Vertex(label) => components.push(WtoComponent::Vertex(label)),
                Slot::Cycle(cycle) => {
                    let mut body = self.finish(cycle);
                    // The head is added last, so it comes first.
                    let head = match body.first() {
                        Some(WtoComponent::Vertex(head)) => head.clone(),
                        _ => panic!("Bug! cycle without a head vertex"),
                    };
                    body.remove(0);
                    components.push(WtoComponent::Cycle(WtoCycle { head, components: body }));
                }
            }
        }
        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(i32, i32)]) -> Cfg {
        let mut cfg = Cfg::new();
        let label = |i: i32| if i < 0 { Label::entry() } else { Label::new(i) };
        for &(a, b) in edges {
            cfg.add_edge(&label(a), &label(b));
        }
        cfg
    }

    #[test]
    fn test_straight_line() {
        let wto = Wto::new(&graph(&[(-1, 0), (0, 1), (1, 2)]));
        assert_eq!(wto.to_string(), "entry 0 1 2");
        assert!(wto.loop_heads().is_empty());
    }

    #[test]
    fn test_single_loop() {
        // entry -> 0 -> 1 -> 2 -> 1, 2 -> 3
        let wto = Wto::new(&graph(&[(-1, 0), (0, 1), (1, 2), (2, 1), (2, 3)]));
        assert_eq!(wto.to_string(), "entry 0 ( 1 2 ) 3");
        assert_eq!(wto.loop_heads(), vec![Label::new(1)]);
        assert!(wto.in_cycle(&Label::new(2), &Label::new(1)));
        assert!(wto.in_cycle(&Label::new(1), &Label::new(1)));
        assert!(!wto.in_cycle(&Label::new(0), &Label::new(1)));
    }

    #[test]
    fn test_nested_loops() {
        // Outer loop 1..4, inner loop 2..3.
        let wto = Wto::new(&graph(&[(-1, 0), (0, 1), (1, 2), (2, 3), (3, 2), (3, 4), (4, 1), (1, 5)]));
        assert_eq!(wto.loop_heads(), vec![Label::new(1), Label::new(2)]);
        assert_eq!(wto.nesting(&Label::new(3)), &[Label::new(1), Label::new(2)]);
        assert_eq!(wto.nesting(&Label::new(4)), &[Label::new(1)]);
        assert!(wto.nesting(&Label::new(5)).is_empty());
    }

    #[test]
    fn test_self_loop() {
        let wto = Wto::new(&graph(&[(-1, 0), (0, 0), (0, 1)]));
        assert_eq!(wto.to_string(), "entry ( 0 ) 1");
    }
}
