//! Client SDK rendering
//!
//! Produces the TypeScript client module for the compiled surface: one
//! typed method per action and view plus the subscription helper. Pure
//! template substitution over the artifact; the text's exact shape is
//! only contractual in the method names and endpoint paths.

use forge_core::{Artifact, FieldType, ViewPlan};

/// Render the client SDK source for an artifact.
pub fn render_sdk(artifact: &Artifact) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "// Generated client for {} v{}; do not edit.\n\n",
        artifact.app.name, artifact.app.version
    ));
    out.push_str(CLIENT_PRELUDE);

    for entity in artifact.entities.values() {
        out.push_str(&format!("export interface {} {{\n", entity.name));
        out.push_str("  id: string;\n");
        for column in &entity.columns {
            out.push_str(&format!(
                "  {}{}: {};\n",
                column.name,
                if column.nullable { "?" } else { "" },
                ts_type(&column.field_type)
            ));
        }
        out.push_str("  created_at: string;\n  updated_at: string;\n}\n\n");
    }

    out.push_str("export class ForgeClient extends ForgeClientBase {\n");
    for action in artifact.actions.values() {
        out.push_str(&format!(
            "  {name}(input: Partial<{input}>): Promise<Envelope<{output}>> {{\n    return this.post('/api/actions/{name}', input);\n  }}\n\n",
            name = action.name,
            input = action.input,
            output = action.creates.as_deref().unwrap_or("unknown"),
        ));
    }
    for view in artifact.views.values() {
        out.push_str(&format!(
            "  {name}(query: ViewQuery = {{}}): Promise<Envelope<Page<{item}>>> {{\n    return this.get('/api/views/{name}', query);\n  }}\n\n",
            name = view.name,
            item = view_item_type(view),
        ));
    }
    out.push_str(
        "  subscribe(view: string, onUpdate: (frame: ServerFrame) => void): () => void {\n    return this.subscribeTo(view, onUpdate);\n  }\n",
    );
    out.push_str("}\n");
    out
}

fn view_item_type(view: &ViewPlan) -> String {
    let fields: Vec<String> = view
        .columns
        .iter()
        .map(|c| format!("'{}': {}", c.key, ts_type(&c.field_type)))
        .collect();
    format!("{{ {} }}", fields.join("; "))
}

fn ts_type(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::Text { .. } | FieldType::Uuid | FieldType::Timestamp => "string",
        FieldType::Int | FieldType::Float => "number",
        FieldType::Bool => "boolean",
        FieldType::Json => "unknown",
        FieldType::Enum { .. } => "string",
    }
}

const CLIENT_PRELUDE: &str = r#"export interface Message { code: string; level: string; message?: string }
export interface Envelope<T> { status: 'ok' | 'error'; data: T | null; messages: Message[] }
export interface Page<T> {
  items: T[];
  pagination: { limit: number; has_next: boolean; has_prev: boolean; next_cursor?: string; prev_cursor?: string; total?: number };
}
export interface ViewQuery { [key: string]: string | number | undefined }
export interface ServerFrame { type: 'snapshot' | 'update' | 'artifact_reload'; view?: string; items?: unknown[] }

export class ForgeClientBase {
  constructor(protected baseUrl: string, protected token?: string) {}

  protected headers(): Record<string, string> {
    const headers: Record<string, string> = { 'Content-Type': 'application/json' };
    if (this.token) headers['Authorization'] = `Bearer ${this.token}`;
    return headers;
  }

  protected async post<T>(path: string, body: unknown): Promise<Envelope<T>> {
    const response = await fetch(this.baseUrl + path, {
      method: 'POST',
      headers: this.headers(),
      body: JSON.stringify(body),
    });
    return response.json();
  }

  protected async get<T>(path: string, query: ViewQuery): Promise<Envelope<T>> {
    const params = new URLSearchParams();
    for (const [key, value] of Object.entries(query)) {
      if (value !== undefined) params.set(key, String(value));
    }
    const suffix = params.toString() ? `?${params}` : '';
    const response = await fetch(this.baseUrl + path + suffix, { headers: this.headers() });
    return response.json();
  }

  protected subscribeTo(view: string, onUpdate: (frame: ServerFrame) => void): () => void {
    const url = this.baseUrl.replace(/^http/, 'ws') + '/ws';
    const socket = new WebSocket(url);
    socket.onopen = () => socket.send(JSON.stringify({ type: 'subscribe', view }));
    socket.onmessage = (event) => onUpdate(JSON.parse(event.data));
    return () => {
      socket.send(JSON.stringify({ type: 'unsubscribe', view }));
      socket.close();
    };
  }
}

"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compile, SourceFile};

    #[test]
    fn test_sdk_lists_actions_and_views() {
        let output = compile(&[SourceFile {
            path: "app.forge".to_string(),
            text: r#"
                entity Ticket { subject: text }
                access Ticket { read: true write: true }
                action create_ticket { input: Ticket, creates: Ticket }
                view TicketList { source: Ticket fields: subject }
            "#
            .to_string(),
        }])
        .expect("compile");

        let sdk = render_sdk(&output.artifact);
        assert!(sdk.contains("export interface Ticket"));
        assert!(sdk.contains("create_ticket(input: Partial<Ticket>)"));
        assert!(sdk.contains("'/api/actions/create_ticket'"));
        assert!(sdk.contains("TicketList(query: ViewQuery"));
        assert!(sdk.contains("subscribe(view: string"));
    }
}
