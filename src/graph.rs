//! An arena of operation nodes connected through value indices.
//!
//! Nodes are never removed; rewriting marks the replaced node dead and the arena keeps
//! it until the graph is dropped. [Graph::topo_order] and [Graph::uses] only see live
//! nodes.

use crate::ops::{InferError, OpRegistry, OpView, Operation};
use crate::tensorspec::TensorType;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ValueId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ValueDef {
    Input,
    Constant,
    Result(NodeId),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Value {
    pub name: String,
    pub ty: TensorType,
    pub def: ValueDef,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Node {
    pub loc: String,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub result: ValueId,
    live: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Graph {
    nodes: Vec<Node>,
    values: Vec<Value>,
    outputs: Vec<ValueId>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Unknown value {0}")]
    UnknownValue(ValueId),
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
    #[error("{loc}: {source}")]
    Infer { loc: String, source: InferError },
    #[error("Cannot replace {from} with {to}: types differ")]
    TypeMismatch { from: ValueId, to: ValueId },
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl Node {
    pub fn is_live(&self) -> bool {
        self.live
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: &str, ty: TensorType) -> ValueId {
        self.push_value(name, ty, ValueDef::Input)
    }

    pub fn add_constant(&mut self, name: &str, ty: TensorType) -> ValueId {
        self.push_value(name, ty, ValueDef::Constant)
    }

    /// Appends a node, inferring its result type with `registry`.
    pub fn add_node(
        &mut self,
        registry: &OpRegistry,
        loc: &str,
        op: Operation,
        operands: Vec<ValueId>,
    ) -> Result<NodeId, GraphError> {
        let types = operands
            .iter()
            .map(|&v| self.value(v).map(|v| v.ty.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let ty = registry
            .infer_output(&op, &types)
            .map_err(|source| GraphError::Infer {
                loc: loc.to_owned(),
                source,
            })?;
        let id = NodeId(self.nodes.len() as u32);
        let result = self.push_value(loc, ty, ValueDef::Result(id));
        self.nodes.push(Node {
            loc: loc.to_owned(),
            op,
            operands,
            result,
            live: true,
        });
        Ok(id)
    }

    pub fn mark_output(&mut self, value: ValueId) -> Result<(), GraphError> {
        self.value(value)?;
        self.outputs.push(value);
        Ok(())
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownNode(id))
    }

    pub fn value(&self, id: ValueId) -> Result<&Value, GraphError> {
        self.values
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownValue(id))
    }

    pub fn values(&self) -> impl Iterator<Item = (ValueId, &Value)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (ValueId(i as u32), v))
    }

    pub fn result(&self, node: NodeId) -> Result<ValueId, GraphError> {
        Ok(self.node(node)?.result)
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.live)
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    /// Live nodes reading `value`, in arena order.
    pub fn uses(&self, value: ValueId) -> Vec<NodeId> {
        self.live_nodes()
            .filter(|(_, n)| n.operands.contains(&value))
            .map(|(id, _)| id)
            .collect()
    }

    /// Redirects every live use of `from`, graph outputs included, to `to`.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) -> Result<(), GraphError> {
        if self.value(from)?.ty != self.value(to)?.ty {
            return Err(GraphError::TypeMismatch { from, to });
        }
        for node in self.nodes.iter_mut().filter(|n| n.live) {
            for operand in node.operands.iter_mut().filter(|o| **o == from) {
                *operand = to;
            }
        }
        for output in self.outputs.iter_mut().filter(|o| **o == from) {
            *output = to;
        }
        Ok(())
    }

    pub fn kill(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id.0 as usize)
            .ok_or(GraphError::UnknownNode(id))?;
        node.live = false;
        Ok(())
    }

    /// Live nodes in dependency order; ties are broken by arena index.
    pub fn topo_order(&self) -> Vec<NodeId> {
        let producer = |v: ValueId| match self.values[v.0 as usize].def {
            ValueDef::Result(n) if self.nodes[n.0 as usize].live => Some(n),
            _ => None,
        };
        let mut pending = vec![0usize; self.nodes.len()];
        let mut consumers = vec![vec![]; self.nodes.len()];
        for (id, node) in self.live_nodes() {
            for &operand in &node.operands {
                if let Some(p) = producer(operand) {
                    pending[id.0 as usize] += 1;
                    consumers[p.0 as usize].push(id);
                }
            }
        }
        let mut ready: VecDeque<NodeId> = self
            .live_nodes()
            .filter(|(id, _)| pending[id.0 as usize] == 0)
            .map(|(id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(ready.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for &consumer in &consumers[id.0 as usize] {
                pending[consumer.0 as usize] -= 1;
                if pending[consumer.0 as usize] == 0 {
                    ready.push_back(consumer);
                }
            }
        }
        order
    }

    /// The search's view of a node: operand types, its result type and which operands
    /// are constants.
    pub fn op_view(&self, id: NodeId) -> Result<OpView, GraphError> {
        let node = self.node(id)?;
        let operands = node
            .operands
            .iter()
            .map(|&v| self.value(v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OpView {
            loc: node.loc.clone(),
            op: node.op.clone(),
            constant: operands
                .iter()
                .map(|v| v.def == ValueDef::Constant)
                .collect(),
            operands: operands.into_iter().map(|v| v.ty.clone()).collect(),
            output: self.value(node.result)?.ty.clone(),
        })
    }

    /// Kills live nodes whose results reach neither a graph output nor a live node.
    /// Returns how many were killed.
    pub fn sweep(&mut self) -> usize {
        let mut killed = 0;
        loop {
            let dead: Vec<NodeId> = self
                .live_nodes()
                .filter(|(_, n)| {
                    !self.outputs.contains(&n.result) && self.uses(n.result).is_empty()
                })
                .map(|(id, _)| id)
                .collect();
            if dead.is_empty() {
                return killed;
            }
            for id in &dead {
                self.nodes[id.0 as usize].live = false;
            }
            killed += dead.len();
            log::debug!("swept {} unused nodes", dead.len());
        }
    }

    fn push_value(&mut self, name: &str, ty: TensorType, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value {
            name: name.to_owned(),
            ty,
            def,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::ops::OpKind;
    use crate::shape;
    use crate::tensorspec::{Quant, TensorSpec};

    fn dense() -> TensorType {
        TensorType::Dense(TensorSpec::new(shape![1, 4, 8, 8], Dtype::Float16))
    }

    fn chain() -> (Graph, NodeId, NodeId) {
        let registry = OpRegistry::standard();
        let mut graph = Graph::new();
        let x = graph.add_input("x", dense());
        let floor = graph
            .add_node(&registry, "floor", Operation::simple(OpKind::Floor).unwrap(), vec![x])
            .unwrap();
        let y = graph.result(floor).unwrap();
        let selu = graph
            .add_node(&registry, "selu", Operation::simple(OpKind::Selu).unwrap(), vec![y])
            .unwrap();
        graph.mark_output(graph.result(selu).unwrap()).unwrap();
        (graph, floor, selu)
    }

    #[test]
    fn test_add_node_infers_result() {
        let (graph, floor, _) = chain();
        let result = graph.result(floor).unwrap();
        assert_eq!(graph.value(result).unwrap().ty, dense());
        assert_eq!(graph.value(result).unwrap().def, ValueDef::Result(floor));
    }

    #[test]
    fn test_add_node_reports_location_on_inference_failure() {
        let registry = OpRegistry::standard();
        let mut graph = Graph::new();
        let x = graph.add_input("x", dense());
        let err = graph
            .add_node(&registry, "add", Operation::simple(OpKind::Add).unwrap(), vec![x])
            .unwrap_err();
        assert!(matches!(err, GraphError::Infer { ref loc, .. } if loc == "add"));
    }

    #[test]
    fn test_topo_order_follows_redirected_uses() {
        let registry = OpRegistry::standard();
        let (mut graph, floor, selu) = chain();
        let x = graph.node(floor).unwrap().operands[0];
        // A later node takes over the floor's role.
        let replacement = graph
            .add_node(&registry, "floor2", Operation::simple(OpKind::Floor).unwrap(), vec![x])
            .unwrap();
        graph
            .replace_all_uses(graph.result(floor).unwrap(), graph.result(replacement).unwrap())
            .unwrap();
        graph.kill(floor).unwrap();
        assert_eq!(graph.topo_order(), vec![replacement, selu]);
    }

    #[test]
    fn test_replace_rejects_type_changes() {
        let (mut graph, floor, _) = chain();
        let y = graph.result(floor).unwrap();
        let other = TensorSpec::new(shape![2], Dtype::Float16);
        let other = graph.add_input("z", TensorType::Dense(other));
        let err = graph.replace_all_uses(y, other).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));

        // Same shape and element type, but quantized.
        let quant = Quant::PerTensor {
            scale: 0.5,
            zero_point: 0,
        };
        let quantized = dense().data().clone().with_quant(quant).unwrap();
        let other = graph.add_input("q", TensorType::Dense(quantized));
        let err = graph.replace_all_uses(y, other).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
    }

    #[test]
    fn test_sweep_kills_unused_chains() {
        let registry = OpRegistry::standard();
        let (mut graph, floor, selu) = chain();
        let y = graph.result(floor).unwrap();
        let a = graph
            .add_node(&registry, "a", Operation::simple(OpKind::Floor).unwrap(), vec![y])
            .unwrap();
        let a_out = graph.result(a).unwrap();
        graph
            .add_node(&registry, "b", Operation::simple(OpKind::Selu).unwrap(), vec![a_out])
            .unwrap();
        assert_eq!(graph.sweep(), 2);
        let live: Vec<_> = graph.live_nodes().map(|(id, _)| id).collect();
        assert_eq!(live, vec![floor, selu]);
    }

    #[test]
    fn test_op_view_marks_constants() {
        let registry = OpRegistry::standard();
        let mut graph = Graph::new();
        let x = graph.add_input("x", dense());
        let w = graph.add_constant("w", dense());
        let add = graph
            .add_node(&registry, "add", Operation::simple(OpKind::Add).unwrap(), vec![x, w])
            .unwrap();
        let view = graph.op_view(add).unwrap();
        assert_eq!(view.constant, vec![false, true]);
        assert_eq!(view.loc, "add");
    }
}
