//! Route table construction
//!
//! One entry per action, view and webhook, a CRUD quadruple per entity,
//! the auth surface (mounted by the runtime only when the password
//! provider is configured), health probes, the WebSocket upgrade and
//! the dev introspection paths. Order is deterministic: fixed sections,
//! each iterating a sorted collection.

use crate::normalize::NormalizedSpec;
use forge_core::{HandlerKind, Route};

fn route(method: &str, path: String, handler: HandlerKind, requires_auth: bool) -> Route {
    Route {
        method: method.to_string(),
        path,
        handler,
        requires_auth,
    }
}

/// Build the complete route table.
pub fn build_routes(spec: &NormalizedSpec) -> Vec<Route> {
    let mut routes = vec![
        route("GET", "/health".to_string(), HandlerKind::Health, false),
        route("GET", "/health/ready".to_string(), HandlerKind::Health, false),
        route("GET", "/ws".to_string(), HandlerKind::Ws, true),
    ];

    for name in spec.actions.keys() {
        routes.push(route(
            "POST",
            format!("/api/actions/{}", name),
            HandlerKind::Action { name: name.clone() },
            true,
        ));
    }

    for name in spec.views.keys() {
        routes.push(route(
            "GET",
            format!("/api/views/{}", name),
            HandlerKind::ViewRead { view: name.clone() },
            true,
        ));
    }

    for name in spec.entities.keys() {
        let crud = |method: &str, suffix: &str| {
            route(
                method,
                format!("/api/entities/{}{}", name, suffix),
                HandlerKind::EntityCrud {
                    entity: name.clone(),
                },
                true,
            )
        };
        routes.push(crud("GET", ""));
        routes.push(crud("GET", "/{id}"));
        routes.push(crud("POST", ""));
        routes.push(crud("PUT", "/{id}"));
        routes.push(crud("DELETE", "/{id}"));
    }

    for name in spec.webhooks.keys() {
        routes.push(route(
            "POST",
            format!("/webhooks/{}", name),
            HandlerKind::Webhook { name: name.clone() },
            false,
        ));
    }

    // Password-provider surface; the runtime mounts these only when the
    // configured auth provider is password-based.
    routes.push(route("POST", "/auth/register".to_string(), HandlerKind::Auth, false));
    routes.push(route("POST", "/auth/login".to_string(), HandlerKind::Auth, false));
    routes.push(route("POST", "/auth/refresh".to_string(), HandlerKind::Auth, false));
    routes.push(route("POST", "/auth/logout".to_string(), HandlerKind::Auth, true));
    routes.push(route("GET", "/auth/me".to_string(), HandlerKind::Auth, true));
    routes.push(route("POST", "/auth/password".to_string(), HandlerKind::Auth, true));

    // Development introspection; production serves 404 on these paths.
    routes.push(route("GET", "/_dev".to_string(), HandlerKind::Dev, false));
    routes.push(route("GET", "/_dev/artifact".to_string(), HandlerKind::Dev, false));
    routes.push(route("GET", "/_dev/routes".to_string(), HandlerKind::Dev, false));

    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ParsedFile;
    use crate::normalize::normalize;
    use crate::parser::Parser;

    fn routes_for(source: &str) -> Vec<Route> {
        let (decls, diags) = Parser::parse_source(source, "t.forge");
        assert!(!diags.has_errors());
        let files = vec![ParsedFile {
            path: "t.forge".to_string(),
            decls,
        }];
        build_routes(&normalize(&files).0)
    }

    #[test]
    fn test_entity_crud_quadruple() {
        let routes = routes_for("entity Ticket { subject: text }");
        let ticket_routes: Vec<&Route> = routes
            .iter()
            .filter(|r| matches!(&r.handler, HandlerKind::EntityCrud { entity } if entity == "Ticket"))
            .collect();
        let methods: Vec<&str> = ticket_routes.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(methods, vec!["GET", "GET", "POST", "PUT", "DELETE"]);
        assert!(ticket_routes
            .iter()
            .any(|r| r.path == "/api/entities/Ticket/{id}"));
    }

    #[test]
    fn test_action_view_webhook_routes() {
        let routes = routes_for(
            r#"
            entity Ticket { subject: text }
            action create_ticket { input: Ticket, creates: Ticket }
            view TicketList { source: Ticket fields: subject }
            webhook stripe_events { provider: stripe, action: create_ticket }
        "#,
        );
        assert!(routes
            .iter()
            .any(|r| r.path == "/api/actions/create_ticket" && r.method == "POST"));
        assert!(routes
            .iter()
            .any(|r| r.path == "/api/views/TicketList" && r.method == "GET"));
        let webhook = routes
            .iter()
            .find(|r| r.path == "/webhooks/stripe_events")
            .unwrap();
        assert!(!webhook.requires_auth);
    }

    #[test]
    fn test_health_and_dev_routes_present() {
        let routes = routes_for("entity Ticket { subject: text }");
        assert!(routes.iter().any(|r| r.path == "/health"));
        assert!(routes.iter().any(|r| r.path == "/health/ready"));
        assert!(routes.iter().any(|r| r.path == "/_dev/artifact"));
        assert!(routes.iter().any(|r| r.path == "/ws"));
    }
}
