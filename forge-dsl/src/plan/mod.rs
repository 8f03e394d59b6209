//! Planner
//!
//! Derives everything the runtime executes from the normalized spec:
//! schema DDL, row-level access policies, rule predicates as SQL, view
//! query plans and the route table, assembled into the artifact
//! document.

pub mod access;
pub mod ddl;
pub mod routes;
pub mod rules;
pub mod sql;
pub mod views;

use crate::normalize::NormalizedSpec;
use forge_core::{ActionPlan, Artifact, ARTIFACT_FORMAT_VERSION};
use std::collections::BTreeMap;

/// Assemble the artifact from a normalized spec.
pub fn build_artifact(spec: &NormalizedSpec, source_digest: String) -> Artifact {
    let access = access::lower_access(spec);
    let rules = rules::lower_rules(spec);
    let views = views::plan_views(spec);
    let routes = routes::build_routes(spec);
    let ddl = ddl::generate_ddl(spec, &access);

    let actions: BTreeMap<String, ActionPlan> = spec
        .actions
        .values()
        .map(|action| {
            (
                action.name.clone(),
                ActionPlan {
                    name: action.name.clone(),
                    input: action.input.clone(),
                    creates: action.creates.clone(),
                    updates: action.updates.clone(),
                    deletes: action.deletes.clone(),
                    // Authorization is carried by the storage policies;
                    // the handler-entry check is the auth requirement
                    // on the route.
                    access_sql: None,
                },
            )
        })
        .collect();

    Artifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        compiler_version: env!("CARGO_PKG_VERSION").to_string(),
        source_digest,
        app: spec.app_info(),
        entities: spec.entities.clone(),
        relations: spec.relations.clone(),
        rules,
        access,
        messages: spec.messages.clone(),
        actions,
        views,
        routes,
        hooks: spec.hooks.clone(),
        jobs: spec.jobs.clone(),
        webhooks: spec.webhooks.clone(),
        tests: spec.tests.clone(),
        migration_acks: spec.migration_acks.clone(),
        ddl,
    }
}
