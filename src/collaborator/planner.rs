use async_trait::async_trait;
use serde_json::json;

use crate::collaborator::{
    ChangeKind, CollaboratorResult, Diff, FileChange, PlanGenerator, TestPlan, TestStep,
};
use crate::config::PlannerConfig;

/// Directories whose files map onto application routes.
const ROUTE_ROOTS: &[&str] = &["pages", "app", "routes", "views"];

const PAGE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "vue", "svelte", "html", "php", "rb", "py"];

/// File stems that stand for their directory's route.
const INDEX_STEMS: &[&str] = &["index", "page", "layout", "+page"];

const SELECTOR_TIMEOUT_MS: u64 = 10_000;

/// Deterministic plan generator that derives steps from changed paths.
#[derive(Debug, Clone, Default)]
pub struct HeuristicPlanGenerator {
    config: PlannerConfig,
}

impl HeuristicPlanGenerator {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn plan(&self, diff: &Diff) -> TestPlan {
        let mut steps = Vec::new();

        if diff.relevant_files().next().is_some() {
            steps.push(TestStep::new(
                "baseline-navigate",
                "Application root responds",
                json!({"action": "navigate", "path": "/"}),
            ));
            steps.push(TestStep::new(
                "baseline-body",
                "Root page renders a body",
                json!({"action": "wait_for_selector", "selector": "body", "timeout_ms": SELECTOR_TIMEOUT_MS}),
            ));
            steps.push(TestStep::new(
                "baseline-title",
                "Root page has a title",
                json!({"action": "check_title", "pattern": r"\S"}),
            ));

            let mut routes: Vec<String> = Vec::new();
            for route in diff.relevant_files().filter_map(route_for) {
                if route != "/" && !routes.contains(&route) {
                    routes.push(route);
                }
            }
            for (i, route) in routes.into_iter().take(self.config.max_route_steps).enumerate() {
                steps.push(TestStep::new(
                    format!("route-{}", i + 1),
                    format!("Changed route {} responds", route),
                    json!({"action": "navigate", "path": route}),
                ));
            }
        }

        for (i, command) in self.config.check_commands.iter().enumerate() {
            steps.push(TestStep::new(
                format!("check-{}", i + 1),
                format!("Check command `{}` succeeds", command),
                json!({"action": "run", "command": command}),
            ));
        }

        TestPlan::new(steps)
    }
}

#[async_trait]
impl PlanGenerator for HeuristicPlanGenerator {
    async fn generate(&self, diff: &Diff) -> CollaboratorResult<TestPlan> {
        let plan = self.plan(diff);
        tracing::debug!(steps = plan.len(), files = diff.files.len(), "Generated test plan");
        Ok(plan)
    }
}

/// Route served by a changed page file, if it maps onto one.
///
/// Dynamic segments (`[id]`, `:id`) and private files (`_app`) yield no route;
/// route groups such as `(marketing)` are dropped from the path.
fn route_for(change: &FileChange) -> Option<String> {
    if change.kind == ChangeKind::Deleted {
        return None;
    }
    let segments: Vec<&str> = change.path.split('/').collect();
    let root = segments.iter().position(|s| ROUTE_ROOTS.contains(s))?;
    let rest = &segments[root + 1..];
    let (file, dirs) = rest.split_last()?;

    let (stem, ext) = file.rsplit_once('.')?;
    if !PAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in dirs.iter().copied().chain(std::iter::once(stem)) {
        if segment.starts_with('_') || segment.starts_with('[') || segment.starts_with(':') {
            return None;
        }
        if segment.starts_with('(') && segment.ends_with(')') {
            continue;
        }
        parts.push(segment);
    }
    if parts.last().is_some_and(|last| INDEX_STEMS.contains(last)) {
        parts.pop();
    }
    Some(format!("/{}", parts.join("/")))
}
