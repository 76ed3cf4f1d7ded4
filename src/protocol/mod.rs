//! # Módulo de Protocolo de Trace - Estruturas de Dados
//!
//! Este módulo define todas as **estruturas de dados** que compõem o
//! artefato de trace em disco: metadados do run, registros de step,
//! snapshots de memória e diffs estruturais.
//!
//! ## O que é um trace?
//!
//! Um trace é a gravação completa de uma execução de agente autônomo.
//! É o "idioma" que o Recorder escreve e que o Replay e a Análise leem:
//! - **O quê** o agente fez (steps, fases, payloads)
//! - **Como** a memória evoluiu (snapshots e diffs)
//! - **O que saiu** de cada ferramenta (streams de I/O)
//!
//! ## Layout em disco de um run:
//!
//! ```text
//! <run_dir>/
//!   meta.json               # metadados do run
//!   steps.jsonl             # um step por linha, terminada em newline
//!   snapshots/step_<id>.json
//!   diffs/step_<id>.diff.json
//!   tools/step_<id>.stdout  # bytes crus
//!   tools/step_<id>.stderr  # bytes crus
//! ```
//!
//! ## Hierarquia de Tipos:
//!
//! ```text
//! RunMeta (metadados + status terminal)
//! StepRecord[] (log append-only)
//!     ├── Phase (reason | tool | observe | memory | retry | terminate)
//!     ├── StepStatus (ok | error | retry)
//!     └── state_ref / diff_ref (sidecars preguiçosos)
//! Snapshot (memória + tokens + estado de ferramentas)
//! StateDiff (delta estrutural entre snapshots consecutivos)
//! ```
//!
//! Campos desconhecidos em `meta.json` e nos registros de step são
//! preservados em round-trip via `#[serde(flatten)]` - um leitor antigo
//! nunca destrói o que um gravador mais novo escreveu.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// NOMES DE ARQUIVO DO LAYOUT
// ============================================================================

/// Nome do arquivo de metadados dentro do diretório do run.
pub const META_FILE: &str = "meta.json";

/// Nome do log de steps (JSON Lines, append-only).
pub const STEPS_FILE: &str = "steps.jsonl";

/// Subdiretório de snapshots.
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Subdiretório de diffs.
pub const DIFFS_DIR: &str = "diffs";

/// Subdiretório de streams de I/O de ferramentas.
pub const TOOLS_DIR: &str = "tools";

/// Caminho relativo do snapshot de um step.
///
/// Exemplo: `snapshot_rel_path(3)` → `"snapshots/step_3.json"`
pub fn snapshot_rel_path(step_id: u64) -> String {
    format!("{}/step_{}.json", SNAPSHOTS_DIR, step_id)
}

/// Caminho relativo do diff de um step.
///
/// Exemplo: `diff_rel_path(3)` → `"diffs/step_3.diff.json"`
pub fn diff_rel_path(step_id: u64) -> String {
    format!("{}/step_{}.diff.json", DIFFS_DIR, step_id)
}

/// Caminho relativo de um stream de I/O capturado.
///
/// Exemplo: `tool_io_rel_path(3, IoStream::Stderr)` → `"tools/step_3.stderr"`
pub fn tool_io_rel_path(step_id: u64, stream: IoStream) -> String {
    format!("{}/step_{}.{}", TOOLS_DIR, step_id, stream.as_str())
}

// ============================================================================
// STREAMS DE I/O
// ============================================================================

/// Identifica qual stream de uma ferramenta foi capturado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStream {
    /// Saída padrão da ferramenta.
    Stdout,
    /// Saída de erro da ferramenta.
    Stderr,
}

impl IoStream {
    /// Sufixo de arquivo correspondente ao stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

// ============================================================================
// METADADOS DO RUN: RUN META
// ============================================================================

/// Status terminal (ou corrente) de um run.
///
/// `Running` é o estado inicial gravado em `create`; os demais são
/// escritos exatamente uma vez, no momento do seal.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")] // "running", "limit_exceeded", etc.
pub enum RunStatus {
    /// Run ainda não selado. Um run carregado neste estado é `partial`.
    Running,
    /// Execução terminou com sucesso.
    Success,
    /// Execução terminou com falha do agente.
    Failure,
    /// Run truncado por atingir o limite de steps.
    LimitExceeded,
    /// Run abortado (cancelamento externo ou drop do recorder).
    Aborted,
}

impl RunStatus {
    /// Indica se este status é terminal (run selado).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Metadados de um run, persistidos em `meta.json`.
///
/// Escritos na criação com `status=running` e reescritos uma única vez
/// no seal com os campos terminais (`status`, `termination_reason`,
/// `truncated`, `steps_digest`).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunMeta {
    /// Identificador estável do run (UUID v4 na prática).
    pub run_id: String,

    /// Versão do agente que foi gravado.
    pub agent_version: String,

    /// Identificador do modelo (ex: "gpt-4o", "claude-sonnet").
    pub llm: String,

    /// Temperatura usada na amostragem do modelo.
    pub temperature: f64,

    /// Nomes das ferramentas habilitadas para o agente.
    pub tools: Vec<String>,

    /// Seed de aleatoriedade do agente.
    pub seed: i64,

    /// Data/hora de criação em formato ISO-8601.
    ///
    /// Ex: "2024-01-15T12:00:00Z"
    pub created_at: String,

    /// Status do run. Terminal após o seal.
    pub status: RunStatus,

    /// Motivo de término, escrito apenas no seal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,

    /// Indica que o run foi truncado pelo limite de steps.
    #[serde(default)]
    pub truncated: bool,

    /// Tags livres (ex: "simulation", "source:<run_id>").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Digest SHA-256 (hex) de `steps.jsonl`, escrito no seal.
    ///
    /// Permite ao `inspect` detectar mutação de um run selado.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_digest: Option<String>,

    /// Campos desconhecidos, preservados em round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// PASSO DE EXECUÇÃO: STEP RECORD
// ============================================================================

/// Fase de um step - o tipo de ação observável que ele representa.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Chamada de modelo: prompt como input, resposta como output.
    Reason,
    /// Invocação de ferramenta.
    Tool,
    /// Observação do ambiente pelo agente.
    Observe,
    /// Atualização de memória do agente.
    Memory,
    /// Tentativa falha de ferramenta antes de um retry.
    Retry,
    /// Passo final emitido em truncamento por limite.
    Terminate,
}

impl Phase {
    /// Nome em formato de wire ("reason", "tool", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reason => "reason",
            Self::Tool => "tool",
            Self::Observe => "observe",
            Self::Memory => "memory",
            Self::Retry => "retry",
            Self::Terminate => "terminate",
        }
    }
}

/// Status de um step após o fechamento do escopo.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Escopo fechou normalmente.
    Ok,
    /// Escopo fechou por falha ou cancelamento.
    Error,
    /// Tentativa que será repetida (fase `retry`) ou pivô de contrafactual.
    Retry,
}

/// Um registro de step - uma linha de `steps.jsonl`.
///
/// ## Campos obrigatórios:
/// - `step_id`: inteiro contíguo começando em 1
/// - `timestamp`: milissegundos desde a época Unix
/// - `phase`, `status`: enums de wire
/// - `input` / `output`: payloads estruturados (já redigidos)
/// - `state_ref`: caminho relativo do snapshot associado
///
/// ## Campos opcionais:
/// - `diff_ref`: caminho relativo do diff contra o snapshot anterior
/// - `duration_ms`: duração medida no fechamento do escopo
///
/// Campos que este gravador não conhece são mantidos em `extra` e
/// reescritos intactos - requisito para contrafactuais byte-fiéis.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StepRecord {
    /// Identificador sequencial do step, começando em 1.
    ///
    /// Lacunas na sequência indicam corrupção do artefato.
    pub step_id: u64,

    /// Timestamp do fechamento do escopo, em milissegundos.
    pub timestamp: i64,

    /// Fase do step.
    pub phase: Phase,

    /// Payload de entrada (mapa estruturado, redigido).
    pub input: Map<String, Value>,

    /// Payload de saída (mapa estruturado, redigido).
    pub output: Map<String, Value>,

    /// Caminho relativo do snapshot deste step.
    ///
    /// Ex: "snapshots/step_3.json"
    pub state_ref: String,

    /// Caminho relativo do diff contra o snapshot anterior, se houver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_ref: Option<String>,

    /// Status final do step.
    pub status: StepStatus,

    /// Duração do escopo em milissegundos.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Campos desconhecidos, preservados em round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StepRecord {
    /// Nome da ferramenta registrada, quando o step é fase `tool`/`retry`.
    ///
    /// O wrapper de ferramenta grava `input.tool` com o nome; o cursor de
    /// replay casa por este campo, não pelo `step_id`.
    pub fn tool_name(&self) -> Option<&str> {
        self.input.get("tool").and_then(Value::as_str)
    }
}

// ============================================================================
// SNAPSHOT DE ESTADO
// ============================================================================

/// Uma entrada de memória do agente.
///
/// O conteúdo é aberto de propósito: cada agente estrutura sua memória
/// do próprio jeito. `role` é a convenção mínima comum.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MemoryEntry {
    /// Papel da entrada (ex: "user", "assistant", "observation").
    #[serde(default)]
    pub role: String,

    /// Conteúdo estruturado da entrada.
    #[serde(default)]
    pub content: Value,

    /// Campos adicionais específicos do agente.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Estado de memória do agente em um instante, sem identidade de step.
///
/// É o que a instrumentação entrega em `update_memory`; o recorder o
/// congela como [`Snapshot`] ao fechar o step seguinte.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct MemoryState {
    /// Lista ordenada de entradas de memória.
    #[serde(default)]
    pub memory: Vec<MemoryEntry>,

    /// Contagem de tokens de contexto reportada pelo agente.
    #[serde(default)]
    pub context_tokens: u64,

    /// Estado por ferramenta (mapa aberto).
    #[serde(default)]
    pub tools_state: Map<String, Value>,
}

/// Snapshot persistido em `snapshots/step_<id>.json`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Snapshot {
    /// Step ao qual este snapshot pertence.
    pub step_id: u64,

    /// Estado de memória congelado.
    #[serde(flatten)]
    pub state: MemoryState,
}

// ============================================================================
// DIFF ESTRUTURAL
// ============================================================================

/// Uma mudança atômica entre dois snapshots.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DiffChange {
    /// Caminho estrutural até o valor (ex: ["memory", "0", "content"]).
    pub path: Vec<String>,

    /// Valor anterior (`null` quando o caminho não existia).
    pub old_value: Value,

    /// Valor novo (`null` quando o caminho foi removido).
    pub new_value: Value,
}

/// Delta estrutural persistido em `diffs/step_<id>.diff.json`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StateDiff {
    /// Step cujo snapshot é o lado "novo" do delta.
    pub step_id: u64,

    /// Lista ordenada de mudanças.
    pub changes: Vec<DiffChange>,
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(
            serde_json::to_string(&Phase::Reason).unwrap(),
            "\"reason\""
        );
        assert_eq!(
            serde_json::to_string(&Phase::Terminate).unwrap(),
            "\"terminate\""
        );
        let p: Phase = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(p, Phase::Retry);
    }

    #[test]
    fn test_run_status_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::LimitExceeded).unwrap(),
            "\"limit_exceeded\""
        );
        assert!(RunStatus::LimitExceeded.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_record_preserves_unknown_fields() {
        // Um gravador futuro pode anexar campos que esta versão não
        // conhece; o round-trip não pode destruí-los.
        let line = json!({
            "step_id": 1,
            "timestamp": 1700000000000i64,
            "phase": "tool",
            "input": {"tool": "search", "args": {"q": 1}},
            "output": {"result": "R"},
            "state_ref": "snapshots/step_1.json",
            "status": "ok",
            "replay_of": 7,
            "custom_annotation": {"a": true}
        })
        .to_string();

        let record: StepRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(record.step_id, 1);
        assert_eq!(record.tool_name(), Some("search"));
        assert_eq!(record.extra.get("replay_of"), Some(&json!(7)));

        let back: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(back["custom_annotation"], json!({"a": true}));
        assert_eq!(back["replay_of"], json!(7));
    }

    #[test]
    fn test_meta_optional_fields_omitted() {
        let meta = RunMeta {
            run_id: "r1".into(),
            agent_version: "1".into(),
            llm: "m".into(),
            temperature: 0.0,
            tools: vec!["s".into()],
            seed: 0,
            created_at: "2024-01-15T12:00:00Z".into(),
            status: RunStatus::Running,
            termination_reason: None,
            truncated: false,
            tags: Vec::new(),
            steps_digest: None,
            extra: Map::new(),
        };
        let v = serde_json::to_value(&meta).unwrap();
        assert!(v.get("termination_reason").is_none());
        assert!(v.get("tags").is_none());
        assert!(v.get("steps_digest").is_none());
        assert_eq!(v["status"], "running");
    }

    #[test]
    fn test_sidecar_paths() {
        assert_eq!(snapshot_rel_path(3), "snapshots/step_3.json");
        assert_eq!(diff_rel_path(12), "diffs/step_12.diff.json");
        assert_eq!(
            tool_io_rel_path(4, IoStream::Stderr),
            "tools/step_4.stderr"
        );
    }

    #[test]
    fn test_snapshot_flattens_memory_state() {
        let snap = Snapshot {
            step_id: 2,
            state: MemoryState {
                memory: vec![MemoryEntry {
                    role: "observation".into(),
                    content: json!("ok"),
                    extra: Map::new(),
                }],
                context_tokens: 128,
                tools_state: Map::new(),
            },
        };
        let v = serde_json::to_value(&snap).unwrap();
        // Schema de wire: step_id, memory, context_tokens, tools_state no
        // mesmo nível (sem objeto "state" aninhado).
        assert_eq!(v["step_id"], 2);
        assert_eq!(v["context_tokens"], 128);
        assert_eq!(v["memory"][0]["role"], "observation");
    }
}
