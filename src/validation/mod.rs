//! # Módulo de Validação de Artefatos
//!
//! Valida um run carregado contra os schemas de wire e as invariantes
//! estruturais antes de qualquer análise confiar nele.
//!
//! ## Para leigos:
//!
//! Imagine receber uma fita de segurança para perícia. Antes de tirar
//! conclusões, você confere: a fita é do formato esperado? Está com os
//! frames em sequência? O lacre confere? Este módulo faz exatamente
//! isso para os artefatos de trace.
//!
//! ## Validações realizadas:
//!
//! 1. **Schema de metadados**: `meta.json` tem as chaves obrigatórias
//! 2. **Schema de steps**: cada linha do log tem a forma esperada
//! 3. **Contiguidade**: step_ids formam a sequência 1..N sem lacunas
//! 4. **Snapshots em run selado**: todo step não-terminal tem snapshot
//!    que existe e parseia
//! 5. **Lacre**: o digest gravado no seal confere com o log corrente
//!
//! Cada problema vira uma violação estruturada; o chamador decide se
//! aborta ou relata. Um run parcial pula as validações que só fazem
//! sentido depois do seal.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::Phase;
use crate::store::LoadedRun;

// ============================================================================
// TIPOS DE VIOLAÇÃO
// ============================================================================

/// Violações detectáveis em um artefato de run.
///
/// Cada variante representa um tipo específico de problema encontrado.
/// O atributo `#[error(...)]` define a mensagem que será exibida.
#[derive(Debug, Error)]
pub enum ArtifactViolation {
    /// `meta.json` não passa no schema de wire.
    #[error("metadados não passam no schema: {detail}")]
    MetaSchema { detail: String },

    /// Um registro de step não passa no schema de wire.
    #[error("step {step_id}: registro não passa no schema: {detail}")]
    StepSchema { step_id: u64, detail: String },

    /// Sequência de identificadores com lacuna ou fora de ordem.
    #[error("sequência de steps não contígua: esperado {expected}, encontrado {found}")]
    StepGap { expected: u64, found: u64 },

    /// Step não-terminal de run selado sem snapshot no disco.
    #[error("step {step_id}: snapshot ausente em run selado")]
    MissingSnapshot { step_id: u64 },

    /// Snapshot presente mas malformado.
    #[error("step {step_id}: snapshot não passa no schema: {detail}")]
    SnapshotSchema { step_id: u64, detail: String },

    /// Digest do log não confere com o gravado no seal.
    #[error("digest do log não confere: selado {recorded}, recalculado {actual}")]
    DigestMismatch { recorded: String, actual: String },
}

// ============================================================================
// SCHEMAS DE WIRE (EMBUTIDOS)
// ============================================================================

/// Schema de `meta.json`.
static META_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": [
            "run_id", "agent_version", "llm", "temperature",
            "tools", "seed", "created_at", "status", "truncated"
        ],
        "properties": {
            "run_id": {"type": "string", "minLength": 1},
            "agent_version": {"type": "string"},
            "llm": {"type": "string"},
            "temperature": {"type": "number"},
            "tools": {"type": "array", "items": {"type": "string"}},
            "seed": {"type": "integer"},
            "created_at": {"type": "string"},
            "status": {
                "type": "string",
                "enum": ["running", "success", "failure", "limit_exceeded", "aborted"]
            },
            "termination_reason": {"type": "string"},
            "truncated": {"type": "boolean"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "steps_digest": {"type": "string"}
        }
    })
});

/// Schema de um registro de step.
///
/// `additionalProperties` fica liberado de propósito: campos
/// desconhecidos são preservados em round-trip, não rejeitados.
static STEP_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["step_id", "timestamp", "phase", "input", "output", "state_ref", "status"],
        "properties": {
            "step_id": {"type": "integer", "minimum": 1},
            "timestamp": {"type": "integer"},
            "phase": {
                "type": "string",
                "enum": ["reason", "tool", "observe", "memory", "retry", "terminate"]
            },
            "input": {"type": "object"},
            "output": {"type": "object"},
            "state_ref": {"type": "string", "minLength": 1},
            "diff_ref": {"type": "string"},
            "status": {"type": "string", "enum": ["ok", "error", "retry"]},
            "duration_ms": {"type": "integer", "minimum": 0}
        }
    })
});

/// Schema de um snapshot.
static SNAPSHOT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["step_id", "memory", "context_tokens", "tools_state"],
        "properties": {
            "step_id": {"type": "integer", "minimum": 1},
            "memory": {"type": "array", "items": {"type": "object"}},
            "context_tokens": {"type": "integer", "minimum": 0},
            "tools_state": {"type": "object"}
        }
    })
});

/// Valida um valor contra um schema embutido, devolvendo as mensagens.
fn schema_errors(schema: &Value, instance: &Value) -> Option<String> {
    // Compila por chamada, como o resto do código faz com schemas
    // vindos de fora; os embutidos são pequenos.
    let compiled = match JSONSchema::compile(schema) {
        Ok(s) => s,
        Err(e) => return Some(format!("schema embutido inválido: {}", e)),
    };

    let result = compiled.validate(instance);
    match result {
        Ok(()) => None,
        Err(errors) => {
            let msgs: Vec<String> = errors.map(|e| e.to_string()).collect();
            Some(msgs.join("; "))
        }
    }
}

// ============================================================================
// VALIDAÇÃO DE RUN
// ============================================================================

/// Valida um run carregado; devolve todas as violações encontradas.
///
/// Nunca aborta na primeira: o relatório completo vale mais que o
/// primeiro erro.
pub fn validate_run(run: &LoadedRun) -> Vec<ArtifactViolation> {
    let mut violations = Vec::new();

    // 1. Schema dos metadados.
    if let Ok(meta_value) = serde_json::to_value(&run.meta) {
        if let Some(detail) = schema_errors(&META_SCHEMA, &meta_value) {
            violations.push(ArtifactViolation::MetaSchema { detail });
        }
    }

    // 2. Schema de cada step + 3. contiguidade 1..N.
    let mut expected: u64 = 1;
    for step in &run.steps {
        if let Ok(step_value) = serde_json::to_value(step) {
            if let Some(detail) = schema_errors(&STEP_SCHEMA, &step_value) {
                violations.push(ArtifactViolation::StepSchema {
                    step_id: step.step_id,
                    detail,
                });
            }
        }

        if step.step_id != expected {
            violations.push(ArtifactViolation::StepGap {
                expected,
                found: step.step_id,
            });
            // Ressincroniza para não cascatear a mesma lacuna.
            expected = step.step_id;
        }
        expected += 1;
    }

    // 4. Snapshots de run selado: todo step não-terminal precisa do
    // sidecar presente e parseável.
    if run.meta.status.is_terminal() && !run.partial {
        for step in &run.steps {
            if step.phase == Phase::Terminate {
                continue;
            }
            match run.load_snapshot(step.step_id) {
                Ok(Some(snapshot)) => {
                    if let Ok(snap_value) = serde_json::to_value(&snapshot) {
                        if let Some(detail) = schema_errors(&SNAPSHOT_SCHEMA, &snap_value) {
                            violations.push(ArtifactViolation::SnapshotSchema {
                                step_id: step.step_id,
                                detail,
                            });
                        }
                    }
                }
                Ok(None) => {
                    violations.push(ArtifactViolation::MissingSnapshot {
                        step_id: step.step_id,
                    });
                }
                Err(e) => {
                    violations.push(ArtifactViolation::SnapshotSchema {
                        step_id: step.step_id,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    // 5. Lacre: digest gravado no seal confere com o log corrente.
    if let Some(recorded) = &run.meta.steps_digest {
        if !run.partial {
            if let Ok(actual) = run.recompute_digest() {
                if &actual != recorded {
                    violations.push(ArtifactViolation::DigestMismatch {
                        recorded: recorded.clone(),
                        actual,
                    });
                }
            }
        }
    }

    violations
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{snapshot_rel_path, RunMeta, RunStatus, StepRecord, StepStatus};
    use crate::store::{self, ArtifactStore};
    use serde_json::Map;
    use std::fs;
    use tempfile::TempDir;

    fn meta(run_id: &str) -> RunMeta {
        RunMeta {
            run_id: run_id.into(),
            agent_version: "1".into(),
            llm: "m".into(),
            temperature: 0.0,
            tools: vec![],
            seed: 0,
            created_at: "2024-01-15T12:00:00Z".into(),
            status: RunStatus::Running,
            termination_reason: None,
            truncated: false,
            tags: Vec::new(),
            steps_digest: None,
            extra: Map::new(),
        }
    }

    fn record(step_id: u64) -> StepRecord {
        StepRecord {
            step_id,
            timestamp: 1,
            phase: Phase::Observe,
            input: Map::new(),
            output: Map::new(),
            state_ref: snapshot_rel_path(step_id),
            diff_ref: None,
            status: StepStatus::Ok,
            duration_ms: None,
            extra: Map::new(),
        }
    }

    fn snapshot(step_id: u64) -> crate::protocol::Snapshot {
        crate::protocol::Snapshot {
            step_id,
            state: crate::protocol::MemoryState::default(),
        }
    }

    #[test]
    fn test_valid_sealed_run_has_no_violations() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.write_snapshot(&snapshot(1)).unwrap();
        store.append_step(&record(1)).unwrap();
        store.write_snapshot(&snapshot(2)).unwrap();
        store.append_step(&record(2)).unwrap();
        store.seal(RunStatus::Success, None, false).unwrap();

        let run = store::load(&dir).unwrap();
        let violations = validate_run(&run);
        assert!(violations.is_empty(), "violações: {:?}", violations);
    }

    #[test]
    fn test_step_gap_is_detected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.write_snapshot(&snapshot(1)).unwrap();
        store.append_step(&record(1)).unwrap();
        store.write_snapshot(&snapshot(3)).unwrap();
        store.append_step(&record(3)).unwrap();
        store.seal(RunStatus::Success, None, false).unwrap();

        let run = store::load(&dir).unwrap();
        let violations = validate_run(&run);
        assert!(violations
            .iter()
            .any(|v| matches!(v, ArtifactViolation::StepGap { expected: 2, found: 3 })));
    }

    #[test]
    fn test_missing_snapshot_on_sealed_run() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.append_step(&record(1)).unwrap();
        store.seal(RunStatus::Success, None, false).unwrap();

        let run = store::load(&dir).unwrap();
        let violations = validate_run(&run);
        assert!(violations
            .iter()
            .any(|v| matches!(v, ArtifactViolation::MissingSnapshot { step_id: 1 })));
    }

    #[test]
    fn test_partial_run_skips_snapshot_requirement() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.append_step(&record(1)).unwrap();
        drop(store);

        let run = store::load(&dir).unwrap();
        assert!(run.partial);
        let violations = validate_run(&run);
        // Run parcial: ausência de snapshot de cauda é tolerada.
        assert!(violations.is_empty(), "violações: {:?}", violations);
    }

    #[test]
    fn test_digest_mismatch_on_mutated_sealed_run() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.write_snapshot(&snapshot(1)).unwrap();
        store.append_step(&record(1)).unwrap();
        store.seal(RunStatus::Success, None, false).unwrap();

        // Mutação pós-seal: anexa uma linha válida por fora do store.
        let mut line = serde_json::to_string(&record(2)).unwrap();
        line.push('\n');
        let mut existing = fs::read(dir.join("steps.jsonl")).unwrap();
        existing.extend_from_slice(line.as_bytes());
        fs::write(dir.join("steps.jsonl"), existing).unwrap();

        let run = store::load(&dir).unwrap();
        let violations = validate_run(&run);
        assert!(violations
            .iter()
            .any(|v| matches!(v, ArtifactViolation::DigestMismatch { .. })));
    }

    #[test]
    fn test_meta_schema_violation() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run");
        let mut store = ArtifactStore::create(&dir, meta("r1")).unwrap();
        store.seal(RunStatus::Success, None, false).unwrap();
        drop(store);

        // Corrompe o status para um valor fora do enum.
        let raw = fs::read_to_string(dir.join("meta.json")).unwrap();
        let mut v: Value = serde_json::from_str(&raw).unwrap();
        v["status"] = json!("success");
        v["run_id"] = json!("");
        fs::write(dir.join("meta.json"), v.to_string()).unwrap();

        let run = store::load(&dir).unwrap();
        let violations = validate_run(&run);
        assert!(violations
            .iter()
            .any(|v| matches!(v, ArtifactViolation::MetaSchema { .. })));
    }
}
