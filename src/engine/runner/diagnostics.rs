use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::time::{Duration, Instant};

use console::style;
use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;

use crate::error::ScriptError;
use crate::identifier::TaskId;

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Relation between two tasks of a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The source started the target.
    Starts,
    /// The source read the result of the target.
    Reads,
}

/// What happened during a build, besides the results themselves.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Timing of tasks that actually ran.
    pub execution_times: HashMap<TaskId, TaskExecution>,
    /// Tasks reused from the previous build state.
    pub cached: HashSet<TaskId>,
    pub warnings: Vec<(TaskId, String)>,
    pub failures: Vec<(TaskId, ScriptError)>,
    pub graph: DiGraph<TaskId, Edge>,
}

impl Diagnostics {
    /// Failures that originate in the failing task itself.
    ///
    /// Failures inherited from a dependency are left out, and so are deadlock
    /// reports, unless nothing else failed.
    pub fn root_failures(&self) -> Vec<&(TaskId, ScriptError)> {
        let own: Vec<_> = self
            .failures
            .iter()
            .filter(|(_, e)| e.failed_dependency().is_none() && !e.is_deadlock())
            .collect();

        if own.is_empty() {
            self.failures.iter().collect()
        } else {
            own
        }
    }

    /// Renders the task graph as a Mermaid diagram, tasks colored from green
    /// to red by how long they ran. Reused tasks are light blue.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (fastest, slowest) = self
            .execution_times
            .values()
            .map(|exec| exec.duration.as_secs_f64())
            .fold(None, |acc: Option<(f64, f64)>, secs| match acc {
                Some((lo, hi)) => Some((lo.min(secs), hi.max(secs))),
                None => Some((secs, secs)),
            })
            .unwrap_or((0.0, 0.0));
        let span = if slowest - fastest > f64::EPSILON {
            slowest - fastest
        } else {
            1.0
        };

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.to_string().replace('"', "#quot;");

            let (label, color) = match self.execution_times.get(task) {
                Some(exec) => {
                    let heat = (exec.duration.as_secs_f64() - fastest) / span;
                    (format!("{:.2?}", exec.duration), heat_color(heat))
                }
                None if self.cached.contains(task) => ("Cached".to_string(), "#ADD8E6".to_string()),
                None => ("Not run".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for edge in self.graph.edge_references() {
            let arrow = match edge.weight() {
                Edge::Starts => "-->",
                Edge::Reads => "-.->",
            };
            let _ = writeln!(f, "    {} {} {}", edge.source().index(), arrow, edge.target().index());
        }

        f
    }

    /// Human readable summary for the terminal.
    pub fn report(&self) -> String {
        let mut f = String::new();

        for (task, error) in self.root_failures() {
            let _ = writeln!(f, "{} {task}", style("error:").red().bold());
            let _ = writeln!(f, "  {error}");
        }
        for (task, message) in &self.warnings {
            let _ = writeln!(f, "{} {message} ({task})", style("warning:").yellow().bold());
        }

        let _ = writeln!(
            f,
            "{} tasks executed, {} reused, {} failed",
            style(self.execution_times.len()).cyan(),
            style(self.cached.len()).cyan(),
            style(self.failures.len()).cyan()
        );

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat_color(heat: f64) -> String {
    let heat = heat.clamp(0.0, 1.0);
    let (r, g) = if heat < 0.5 {
        ((510.0 * heat) as u8, 255)
    } else {
        (255, (510.0 * (1.0 - heat)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}
