//! Flow 静态校验：结构、节点形状、引用、可达性与同步环路。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use super::constants::END;
use super::nodes::Node;
use super::types::FlowSpec;
use crate::error::ConvoFlowError;

/// 非致命的校验警告
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationWarning {
    /// 从入口无法到达的节点
    Unreachable { node: String },
    /// 不经过任何挂起节点就能回到自身的环路
    SynchronousCycle { path: Vec<String> },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::Unreachable { node } => {
                write!(f, "node `{}` is unreachable from entry", node)
            }
            ValidationWarning::SynchronousCycle { path } => write!(
                f,
                "cycle without suspend point: {}",
                path.join(" -> ")
            ),
        }
    }
}

/// 校验结果
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub error: Option<ConvoFlowError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    fn failed(error: ConvoFlowError) -> Self {
        Self {
            valid: false,
            error: Some(error),
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Flow 校验器
#[derive(Default)]
pub struct FlowValidator;

impl FlowValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, spec: &FlowSpec) -> ValidationReport {
        let checks = self
            .check_structure(spec)
            .and_then(|_| self.check_shapes(spec))
            .and_then(|_| self.check_references(spec));
        if let Err(error) = checks {
            return ValidationReport::failed(error);
        }

        let mut warnings = self.unreachable_nodes(spec);
        warnings.extend(self.synchronous_cycles(spec));
        ValidationReport {
            valid: true,
            error: None,
            warnings,
        }
    }

    fn check_structure(&self, spec: &FlowSpec) -> Result<(), ConvoFlowError> {
        if spec.version.trim().is_empty() {
            return Err(ConvoFlowError::Structural("missing version".into()));
        }
        if spec.entry.trim().is_empty() {
            return Err(ConvoFlowError::Structural("missing entry".into()));
        }
        if spec.nodes.is_empty() {
            return Err(ConvoFlowError::Structural("flow has no nodes".into()));
        }
        if !spec.nodes.contains_key(&spec.entry) {
            return Err(ConvoFlowError::Structural(format!(
                "entry `{}` is not a node",
                spec.entry
            )));
        }
        Ok(())
    }

    fn check_shapes(&self, spec: &FlowSpec) -> Result<(), ConvoFlowError> {
        for id in spec.sorted_ids() {
            let shape_error = |reason: &str| ConvoFlowError::NodeShape {
                node: id.to_string(),
                reason: reason.to_string(),
            };
            match &spec.nodes[id] {
                Node::Message(node) => {
                    if node.text.trim().is_empty() {
                        return Err(shape_error("message text is empty"));
                    }
                }
                Node::QuickReply(node) => {
                    if node.text.trim().is_empty() {
                        return Err(shape_error("quick reply text is empty"));
                    }
                    if node.options.is_empty() {
                        return Err(shape_error("quick reply requires at least one option"));
                    }
                    for option in &node.options {
                        if option.text.trim().is_empty() {
                            return Err(shape_error("quick reply option text is empty"));
                        }
                        if option.go.as_deref().map_or(true, str::is_empty) {
                            return Err(shape_error("quick reply option has no target"));
                        }
                    }
                }
                Node::Condition(node) => {
                    if node.expression.trim().is_empty() {
                        return Err(shape_error("condition expression is empty"));
                    }
                    if node.true_go.as_deref().map_or(true, str::is_empty)
                        || node.false_go.as_deref().map_or(true, str::is_empty)
                    {
                        return Err(shape_error("condition requires trueGo and falseGo"));
                    }
                }
                Node::Action(node) => {
                    if node.action_type.trim().is_empty() {
                        return Err(shape_error("action type is empty"));
                    }
                }
                Node::Wait(node) => {
                    if node.duration_seconds <= 0 {
                        return Err(shape_error("wait duration must be positive"));
                    }
                }
                Node::End => {}
            }
        }
        Ok(())
    }

    fn check_references(&self, spec: &FlowSpec) -> Result<(), ConvoFlowError> {
        for id in spec.sorted_ids() {
            for target in spec.successors(id) {
                if target != END && !spec.nodes.contains_key(target) {
                    return Err(ConvoFlowError::Reference {
                        node: id.to_string(),
                        target: target.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn reachable<'a>(&self, spec: &'a FlowSpec) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([spec.entry.as_str()]);
        while let Some(id) = queue.pop_front() {
            if !spec.nodes.contains_key(id) || !seen.insert(id) {
                continue;
            }
            queue.extend(spec.successors(id));
        }
        seen
    }

    fn unreachable_nodes(&self, spec: &FlowSpec) -> Vec<ValidationWarning> {
        let reachable = self.reachable(spec);
        spec.sorted_ids()
            .into_iter()
            .filter(|id| !reachable.contains(id))
            .map(|id| ValidationWarning::Unreachable {
                node: id.to_string(),
            })
            .collect()
    }

    /// 只沿非挂起节点的出边做深度优先搜索，回边即同步环路
    fn synchronous_cycles(&self, spec: &FlowSpec) -> Vec<ValidationWarning> {
        let reachable = self.reachable(spec);
        let mut state: HashMap<&str, Visit> = HashMap::new();
        let mut warnings = Vec::new();

        let roots = std::iter::once(spec.entry.as_str()).chain(spec.sorted_ids());
        for id in roots {
            if reachable.contains(id) && !state.contains_key(id) {
                visit(spec, id, &mut state, &mut warnings);
            }
        }
        warnings
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

struct Frame<'a> {
    id: &'a str,
    /// 逆序存放，pop 时按 id 升序访问
    pending: Vec<&'a str>,
}

fn enter<'a>(
    spec: &'a FlowSpec,
    id: &'a str,
    state: &mut HashMap<&'a str, Visit>,
    path: &mut Vec<&'a str>,
    stack: &mut Vec<Frame<'a>>,
) {
    state.insert(id, Visit::InProgress);
    path.push(id);

    let node = &spec.nodes[id];
    let mut pending = Vec::new();
    if !node.is_suspend_point() {
        pending = node
            .successors()
            .into_iter()
            .filter(|target| spec.nodes.contains_key(*target))
            .collect();
        pending.sort_unstable();
        pending.dedup();
        pending.reverse();
    }
    stack.push(Frame { id, pending });
}

/// 显式栈的深度优先搜索，长链不会耗尽调用栈
fn visit<'a>(
    spec: &'a FlowSpec,
    root: &'a str,
    state: &mut HashMap<&'a str, Visit>,
    warnings: &mut Vec<ValidationWarning>,
) {
    let mut path: Vec<&'a str> = Vec::new();
    let mut stack: Vec<Frame<'a>> = Vec::new();
    enter(spec, root, state, &mut path, &mut stack);

    while let Some(frame) = stack.last_mut() {
        let Some(target) = frame.pending.pop() else {
            let id = frame.id;
            stack.pop();
            path.pop();
            state.insert(id, Visit::Done);
            continue;
        };
        match state.get(target).copied() {
            Some(Visit::InProgress) => {
                let start = path.iter().position(|step| *step == target).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|step| step.to_string()).collect();
                cycle.push(target.to_string());
                warnings.push(ValidationWarning::SynchronousCycle { path: cycle });
            }
            Some(Visit::Done) => {}
            None => enter(spec, target, state, &mut path, &mut stack),
        }
    }
}
