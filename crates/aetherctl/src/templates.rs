//! Project scaffolding for `aetherctl init`.

use std::path::Path;

use anyhow::{bail, Context, Result};

const CONFIG_TEMPLATE: &str = r#"[server]
grpc_port = 7233
http_port = 7234
db_path = "./data/{{project_name}}"

[persistence]
mode = "memory"

[metrics]
enabled = false
port = 7236
"#;

const WORKER_TEMPLATE: &str = r#"#!/usr/bin/env python3
"""Minimal {{project_name}} worker for the Aether coordinator."""

import base64
import time

import requests

SERVER = "http://localhost:7233"
WORKFLOW_TYPE = "{{project_name}}"


def run_step(step_name: str, payload: bytes) -> bytes:
    # Replace with real step logic.
    return b"Hello, " + payload + b"!"


def main() -> None:
    session = requests.Session()
    registration = session.post(
        f"{SERVER}/v1/workers",
        json={
            "service_name": "{{project_name}}-worker",
            "workflow_types": [{"name": WORKFLOW_TYPE}],
        },
    ).json()
    token = registration["session_token"]
    heartbeat_every = registration["heartbeat_interval_ms"] / 1000
    last_heartbeat = time.monotonic()
    print(f"registered as {registration['worker_id']}")

    while True:
        if time.monotonic() - last_heartbeat > heartbeat_every:
            session.post(f"{SERVER}/v1/workers/heartbeat", json={"session_token": token})
            last_heartbeat = time.monotonic()

        batch = session.post(
            f"{SERVER}/v1/tasks/poll",
            json={"session_token": token, "max": 5},
        ).json()
        if not batch["tasks"]:
            time.sleep(0.5)
            continue

        for task in batch["tasks"]:
            payload = base64.b64decode(task["input"])
            try:
                output = run_step(task["step_name"], payload)
                body = {"result": base64.b64encode(output).decode()}
            except Exception as exc:  # noqa: BLE001
                body = {"error": str(exc)}
            session.post(f"{SERVER}/v1/tasks/{task['task_id']}/complete", json=body)


if __name__ == "__main__":
    main()
"#;

const README_TEMPLATE: &str = r#"# {{project_name}}

An Aether workflow project.

## Run

Start the coordinator:

    aetherctl serve --config aether.toml

Start the worker:

    python3 worker.py

Start a workflow:

    curl -X POST http://localhost:7233/v1/workflows \
      -H 'content-type: application/json' \
      -d '{"workflow_type": "{{project_name}}", "input": "V29ybGQ="}'
"#;

fn render(template: &str, project_name: &str) -> String {
    template.replace("{{project_name}}", project_name)
}

/// Write the starter project into `<output>/<name>/`.
pub fn scaffold(name: &str, output: &Path) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        bail!("project name must be alphanumeric with dashes or underscores");
    }

    let root = output.join(name);
    if root.exists() {
        bail!("directory {} already exists", root.display());
    }
    std::fs::create_dir_all(&root)
        .with_context(|| format!("cannot create {}", root.display()))?;

    for (file, template) in [
        ("aether.toml", CONFIG_TEMPLATE),
        ("worker.py", WORKER_TEMPLATE),
        ("README.md", README_TEMPLATE),
    ] {
        std::fs::write(root.join(file), render(template, name))
            .with_context(|| format!("cannot write {}", file))?;
    }

    println!("Created project '{}' in {}", name, root.display());
    println!("  aether.toml  coordinator configuration");
    println!("  worker.py    starter worker");
    println!("  README.md    next steps");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_name() {
        let rendered = render(CONFIG_TEMPLATE, "demo");
        assert!(rendered.contains("./data/demo"));
        assert!(!rendered.contains("{{project_name}}"));
    }

    #[test]
    fn test_scaffold_rejects_bad_names() {
        let dir = std::env::temp_dir();
        assert!(scaffold("has space", &dir).is_err());
        assert!(scaffold("", &dir).is_err());
    }
}
