use itertools::{Itertools, iproduct};
use petgraph::{algo::toposort, graph::DiGraph};
use std::{collections::HashSet, fmt, ops::Range};
use thiserror::Error;

use crate::digits::{CLASSES, IMAGE_SIDE};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("edge {edge} references a node outside 0..{node_count}")]
    UndeclaredNode { edge: Edge, node_count: usize },
    #[error("edge {edge} feeds input node {}", .edge.target)]
    EdgeIntoInput { edge: Edge },
    #[error("edge {edge} connects a node to itself")]
    SelfLoop { edge: Edge },
    #[error("edge {edge} is declared more than once")]
    DuplicateEdge { edge: Edge },
    #[error("node {node} is part of a cycle")]
    Cycle { node: NodeId },
    #[error("node {node} has no incoming edges")]
    Unconnected { node: NodeId },
    #[error("hidden node {node} feeds no other node")]
    Dangling { node: NodeId },
    #[error("stage {stage} has a zero grid, window or stride")]
    EmptyStage { stage: usize },
    #[error("stage {stage} needs a {needed}x{needed} source grid but the source is {available}x{available}")]
    WindowOutOfBounds {
        stage: usize,
        needed: usize,
        available: usize,
    },
}

// How many nodes each layer holds. Node ids are handed out in this order: inputs first, then each
// hidden stage, then the outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub inputs: usize,
    pub hidden: Vec<usize>,
    pub outputs: usize,
}

impl Layout {
    pub fn node_count(&self) -> usize {
        self.inputs + self.hidden.iter().sum::<usize>() + self.outputs
    }

    pub fn inputs(&self) -> Range<NodeId> {
        0..self.inputs
    }

    pub fn hidden(&self, stage: usize) -> Range<NodeId> {
        let start = self.inputs + self.hidden[..stage].iter().sum::<usize>();
        start..start + self.hidden[stage]
    }

    pub fn outputs(&self) -> Range<NodeId> {
        let end = self.node_count();
        end - self.outputs..end
    }

    pub fn is_input(&self, node: NodeId) -> bool {
        node < self.inputs
    }

    pub fn is_hidden(&self, node: NodeId) -> bool {
        !self.is_input(node) && !self.outputs().contains(&node)
    }
}

// A square grid of `grid` x `grid` nodes, each seeing a `window` x `window` patch of the stage below
// it. Neighbouring patches start `stride` cells apart, so a stride smaller than the window gives
// overlapping receptive fields and an equal stride tiles the source exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptiveFieldStage {
    pub grid: usize,
    pub window: usize,
    pub stride: usize,
}

impl ReceptiveFieldStage {
    fn extent(&self) -> usize {
        (self.grid - 1) * self.stride + self.window
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiringPlan {
    pub image_side: usize,
    pub outputs: usize,
    pub stages: Vec<ReceptiveFieldStage>,
}

impl WiringPlan {
    /// The 256-25-10 network used for the 16x16 digits: 16 hidden nodes each seeing one 4x4 tile of
    /// the image, then a coarser 3x3 grid of overlapping 2x2 patches of those tiles, each of the
    /// nine feeding all ten outputs.
    pub fn digits() -> WiringPlan {
        WiringPlan {
            image_side: IMAGE_SIDE,
            outputs: CLASSES,
            stages: vec![
                ReceptiveFieldStage {
                    grid: 4,
                    window: 4,
                    stride: 4,
                },
                ReceptiveFieldStage {
                    grid: 3,
                    window: 2,
                    stride: 1,
                },
            ],
        }
    }

    pub fn layout(&self) -> Layout {
        Layout {
            inputs: self.image_side * self.image_side,
            hidden: self.stages.iter().map(|stage| stage.grid * stage.grid).collect(),
            outputs: self.outputs,
        }
    }

    // Emit the edge list. Each stage tiles the grid below it (the image for the first stage), and
    // the last grid is wired densely to the outputs.
    pub fn edges(&self) -> Result<Vec<Edge>, TopologyError> {
        let layout = self.layout();
        let mut edges = Vec::new();
        let mut source_side = self.image_side;
        let mut source_start = 0;

        for (index, stage) in self.stages.iter().enumerate() {
            if stage.grid == 0 || stage.window == 0 || stage.stride == 0 {
                return Err(TopologyError::EmptyStage { stage: index });
            }
            if stage.extent() > source_side {
                return Err(TopologyError::WindowOutOfBounds {
                    stage: index,
                    needed: stage.extent(),
                    available: source_side,
                });
            }

            let target_start = layout.hidden(index).start;
            for (row, column) in iproduct!(0..stage.grid, 0..stage.grid) {
                let target = target_start + row * stage.grid + column;
                let (top, left) = (row * stage.stride, column * stage.stride);
                for (y, x) in iproduct!(top..top + stage.window, left..left + stage.window) {
                    edges.push(Edge {
                        source: source_start + y * source_side + x,
                        target,
                    });
                }
            }

            source_side = stage.grid;
            source_start = target_start;
        }

        let last = match self.stages.len() {
            0 => layout.inputs(),
            stages => layout.hidden(stages - 1),
        };
        edges.extend(
            iproduct!(last, layout.outputs()).map(|(source, target)| Edge { source, target }),
        );

        Ok(edges)
    }

    pub fn build(&self) -> Result<ConnectionGraph, TopologyError> {
        ConnectionGraph::new(self.layout(), self.edges()?)
    }
}

// A validated feed-forward wiring. Edges are stored grouped by their target in evaluation order, so
// the incoming edges of a node are one contiguous range.
#[derive(Debug, Clone)]
pub struct ConnectionGraph {
    layout: Layout,
    edges: Vec<Edge>,
    order: Vec<NodeId>,
    incoming: Vec<Range<usize>>,
    fan_in: Vec<usize>,
}

impl ConnectionGraph {
    pub fn new(layout: Layout, edges: Vec<Edge>) -> Result<ConnectionGraph, TopologyError> {
        let node_count = layout.node_count();
        let mut seen = HashSet::with_capacity(edges.len());
        for &edge in &edges {
            if edge.source >= node_count || edge.target >= node_count {
                return Err(TopologyError::UndeclaredNode { edge, node_count });
            }
            if layout.is_input(edge.target) {
                return Err(TopologyError::EdgeIntoInput { edge });
            }
            if edge.source == edge.target {
                return Err(TopologyError::SelfLoop { edge });
            }
            if !seen.insert(edge) {
                return Err(TopologyError::DuplicateEdge { edge });
            }
        }

        let mut graph = DiGraph::<(), ()>::with_capacity(node_count, edges.len());
        let nodes = (0..node_count).map(|_| graph.add_node(())).collect_vec();
        for edge in &edges {
            graph.add_edge(nodes[edge.source], nodes[edge.target], ());
        }
        let sorted = toposort(&graph, None).map_err(|cycle| TopologyError::Cycle {
            node: cycle.node_id().index(),
        })?;

        let mut fan_in = vec![0; node_count];
        let mut fan_out = vec![0; node_count];
        for edge in &edges {
            fan_in[edge.target] += 1;
            fan_out[edge.source] += 1;
        }
        if let Some(node) = (layout.inputs..node_count).find(|&node| fan_in[node] == 0) {
            return Err(TopologyError::Unconnected { node });
        }
        if let Some(node) = (layout.inputs..node_count)
            .find(|&node| layout.is_hidden(node) && fan_out[node] == 0)
        {
            return Err(TopologyError::Dangling { node });
        }

        // Depth is the longest path from any input. Visiting nodes by depth and then by id keeps
        // every layer in wiring order while still respecting the edges.
        let mut incoming_sources = vec![Vec::new(); node_count];
        for edge in &edges {
            incoming_sources[edge.target].push(edge.source);
        }
        let mut depth = vec![0usize; node_count];
        for node in sorted.iter().map(|index| index.index()) {
            depth[node] = incoming_sources[node]
                .iter()
                .map(|&source| depth[source] + 1)
                .max()
                .unwrap_or(0);
        }
        let order = (layout.inputs..node_count)
            .sorted_by_key(|&node| (depth[node], node))
            .collect_vec();

        let mut rank = vec![0; node_count];
        for (position, &node) in order.iter().enumerate() {
            rank[node] = position;
        }
        let mut edges = edges;
        edges.sort_by_key(|edge| (rank[edge.target], edge.source));

        let mut incoming = vec![0..0; node_count];
        let mut start = 0;
        for (target, group) in &edges.iter().chunk_by(|edge| edge.target) {
            let end = start + group.count();
            incoming[target] = start..end;
            start = end;
        }

        Ok(ConnectionGraph {
            layout,
            edges,
            order,
            incoming,
            fan_in,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Every non-input node, sources before the nodes they feed.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Positions in [`Self::edges`] of the edges ending at `node`.
    pub fn incoming(&self, node: NodeId) -> Range<usize> {
        self.incoming[node].clone()
    }

    pub fn fan_in(&self, node: NodeId) -> usize {
        self.fan_in[node]
    }

    pub fn node_count(&self) -> usize {
        self.layout.node_count()
    }

    pub fn non_input_count(&self) -> usize {
        self.node_count() - self.layout.inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tiny_layout() -> Layout {
        Layout {
            inputs: 2,
            hidden: vec![1],
            outputs: 1,
        }
    }

    fn edge(source: NodeId, target: NodeId) -> Edge {
        Edge { source, target }
    }

    #[test]
    fn digits_plan_has_expected_shape() {
        let graph = WiringPlan::digits().build().unwrap();
        let layout = graph.layout();

        assert_eq!(layout.inputs, 256);
        assert_eq!(layout.hidden, vec![16, 9]);
        assert_eq!(layout.hidden.iter().sum::<usize>(), 25);
        assert_eq!(layout.outputs, 10);
        assert_eq!(layout.outputs(), 281..291);
        assert_eq!(graph.edges().len(), 16 * 16 + 9 * 4 + 9 * 10);
        assert_eq!(graph.order().len(), 25 + 10);
    }

    #[test]
    fn digits_plan_covers_every_pixel() {
        let graph = WiringPlan::digits().build().unwrap();
        let used: HashSet<_> = graph.edges().iter().map(|edge| edge.source).collect();
        assert!(graph.layout().inputs().all(|pixel| used.contains(&pixel)));
    }

    #[test]
    fn first_stage_windows_are_local() {
        let graph = WiringPlan::digits().build().unwrap();
        // Bottom-right tile covers rows and columns 12..16.
        let node = graph.layout().hidden(0).end - 1;
        let sources = graph
            .incoming(node)
            .map(|index| graph.edges()[index].source)
            .collect_vec();
        let expected = iproduct!(12..16, 12..16).map(|(y, x)| y * 16 + x).collect_vec();
        assert_eq!(sources, expected);
    }

    #[test]
    fn first_stage_tiles_do_not_overlap() {
        let graph = WiringPlan::digits().build().unwrap();
        let mut seen = HashSet::new();
        for node in graph.layout().hidden(0) {
            for index in graph.incoming(node) {
                assert!(seen.insert(graph.edges()[index].source));
            }
        }
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn second_stage_sees_neighbouring_tiles() {
        let graph = WiringPlan::digits().build().unwrap();
        let layout = graph.layout();
        // Centre of the 3x3 grid covers tiles (1, 1), (1, 2), (2, 1) and (2, 2).
        let node = layout.hidden(1).start + 4;
        let sources = graph
            .incoming(node)
            .map(|index| graph.edges()[index].source)
            .collect_vec();
        let tiles = layout.hidden(0).start;
        assert_eq!(sources, vec![tiles + 5, tiles + 6, tiles + 9, tiles + 10]);
    }

    #[test]
    fn order_follows_layers() {
        let graph = WiringPlan::digits().build().unwrap();
        let layout = graph.layout();
        let expected = layout
            .hidden(0)
            .chain(layout.hidden(1))
            .chain(layout.outputs())
            .collect_vec();
        assert_eq!(graph.order(), expected.as_slice());
    }

    #[test]
    fn incoming_ranges_partition_edges() {
        let graph = WiringPlan::digits().build().unwrap();
        let mut covered = 0;
        for &node in graph.order() {
            let range = graph.incoming(node);
            assert_eq!(range.start, covered);
            assert_eq!(range.len(), graph.fan_in(node));
            assert!(graph.edges()[range.clone()].iter().all(|e| e.target == node));
            covered = range.end;
        }
        assert_eq!(covered, graph.edges().len());
    }

    #[test]
    fn rejects_undeclared_node() {
        let result = ConnectionGraph::new(tiny_layout(), vec![edge(0, 2), edge(1, 2), edge(2, 9)]);
        assert_eq!(
            result.unwrap_err(),
            TopologyError::UndeclaredNode {
                edge: edge(2, 9),
                node_count: 4
            }
        );
    }

    #[test]
    fn rejects_unconnected_node() {
        let layout = Layout {
            inputs: 2,
            hidden: vec![2],
            outputs: 1,
        };
        let result = ConnectionGraph::new(layout, vec![edge(0, 2), edge(2, 4), edge(3, 4)]);
        assert_eq!(result.unwrap_err(), TopologyError::Unconnected { node: 3 });
    }

    #[test]
    fn rejects_dangling_hidden_node() {
        let result = ConnectionGraph::new(tiny_layout(), vec![edge(0, 2), edge(1, 3)]);
        assert_eq!(result.unwrap_err(), TopologyError::Dangling { node: 2 });
    }

    #[test]
    fn rejects_malformed_edges() {
        assert_eq!(
            ConnectionGraph::new(tiny_layout(), vec![edge(2, 0)]).unwrap_err(),
            TopologyError::EdgeIntoInput { edge: edge(2, 0) }
        );
        assert_eq!(
            ConnectionGraph::new(tiny_layout(), vec![edge(2, 2)]).unwrap_err(),
            TopologyError::SelfLoop { edge: edge(2, 2) }
        );
        assert_eq!(
            ConnectionGraph::new(tiny_layout(), vec![edge(0, 2), edge(0, 2)]).unwrap_err(),
            TopologyError::DuplicateEdge { edge: edge(0, 2) }
        );
    }

    #[test]
    fn rejects_cycles() {
        let layout = Layout {
            inputs: 1,
            hidden: vec![2],
            outputs: 1,
        };
        let edges = vec![edge(0, 1), edge(1, 2), edge(2, 1), edge(2, 3)];
        assert!(matches!(
            ConnectionGraph::new(layout, edges),
            Err(TopologyError::Cycle { node: 1 | 2 })
        ));
    }

    #[test]
    fn rejects_windows_that_do_not_fit() {
        let mut plan = WiringPlan::digits();
        plan.stages[0].stride = 5;
        assert_eq!(
            plan.build().unwrap_err(),
            TopologyError::WindowOutOfBounds {
                stage: 0,
                needed: 19,
                available: 16
            }
        );

        plan.stages[0].window = 0;
        assert_eq!(plan.build().unwrap_err(), TopologyError::EmptyStage { stage: 0 });
    }

    #[test]
    fn plan_without_stages_is_dense() {
        let plan = WiringPlan {
            image_side: 2,
            outputs: 3,
            stages: Vec::new(),
        };
        let graph = plan.build().unwrap();
        assert_eq!(graph.edges().len(), 4 * 3);
    }

    fn stage() -> impl Strategy<Value = ReceptiveFieldStage> {
        (1usize..5, 1usize..5, 1usize..4).prop_map(|(grid, window, stride)| ReceptiveFieldStage {
            grid,
            window,
            stride,
        })
    }

    proptest! {
        #[test]
        fn valid_plans_are_connected_and_acyclic(
            image_side in 1usize..12,
            outputs in 1usize..6,
            stages in prop::collection::vec(stage(), 0..4),
        ) {
            let plan = WiringPlan { image_side, outputs, stages };
            if let Ok(graph) = plan.build() {
                let layout = graph.layout();
                for node in layout.inputs..layout.node_count() {
                    prop_assert!(graph.fan_in(node) >= 1);
                }

                // Evaluation order must be a topological order of the edges.
                let mut position = vec![None; graph.node_count()];
                for (index, &node) in graph.order().iter().enumerate() {
                    position[node] = Some(index);
                }
                for edge in graph.edges() {
                    let target = position[edge.target].unwrap();
                    if let Some(source) = position[edge.source] {
                        prop_assert!(source < target);
                    }
                }
            }
        }
    }
}
