//! # Módulo do Recorder - Gravação de Runs
//!
//! O recorder é o **único escritor** de um run: ele impõe o ciclo de
//! vida, a ordem dos steps, a redação de segredos, os snapshots e o
//! truncamento limpo por limite.
//!
//! ## Máquina de estados:
//!
//! ```text
//! idle ──init──> recording ──stop──> sealed
//!                    │
//!                    └──limite atingido──> sealed (truncated=true)
//! ```
//!
//! No máximo UM recorder por processo pode estar em `recording`. Um
//! segundo `init` sem `stop` é erro (`AlreadyActive`) em modo estrito e
//! no-op em modo leniente (retorna um handle desabilitado que descarta
//! chamadas).
//!
//! ## Para todos entenderem o escopo de step:
//!
//! Um step é um recurso com escopo, como um arquivo aberto:
//!
//! 1. `step(phase, input)` abre o escopo e reserva o próximo id
//! 2. dentro do escopo você muta `output` e `status`
//! 3. ao fechar (`finish`, `fail`, ou drop por cancelamento) o recorder
//!    carimba timestamp e duração, redige os payloads, grava o snapshot
//!    derivado da memória staged, computa o diff contra o snapshot
//!    anterior e anexa o registro ao log
//!
//! A saída por falha ou cancelamento fecha o MESMO step com
//! `status=error` e a causa no output - nenhum caminho de saída escapa
//! sem registro.
//!
//! ## Garantias de ordem:
//!
//! - ids são atribuídos na ordem de abertura dos escopos
//! - registros aparecem no log na ordem de fechamento
//! - steps aninhados são proibidos (`NestedStep`), então as duas ordens
//!   coincidem e o log é uma ordem total
//! - o snapshot de um step é gravado ANTES do registro dele: quem lê o
//!   step `k` no log pode confiar que `snapshots/step_k` existe

pub mod wrappers;

use chrono::Utc;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{TraceError, TraceResult};
use crate::limits::RecorderLimits;
use crate::protocol::{
    snapshot_rel_path, IoStream, MemoryState, Phase, RunMeta, RunStatus, Snapshot, StepRecord,
    StepStatus,
};
use crate::redaction::{RedactionConfig, Redactor};
use crate::store::ArtifactStore;
use crate::{diff, protocol};

/// Flag de processo: existe um recorder em `recording`?
static PROCESS_ACTIVE: AtomicBool = AtomicBool::new(false);

// ============================================================================
// CONFIGURAÇÃO
// ============================================================================

/// Configuração do recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Diretório raiz onde os runs são criados (um subdiretório por run).
    pub base_dir: PathBuf,

    /// Modo estrito: mau uso vira erro. Leniente: é logado e descartado.
    pub strict: bool,

    /// Limites de gravação.
    pub limits: RecorderLimits,

    /// Política de redação aplicada a todo payload.
    pub redaction: RedactionConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./traces"),
            strict: true,
            limits: RecorderLimits::default(),
            redaction: RedactionConfig::default(),
        }
    }
}

impl RecorderConfig {
    /// Cria configuração a partir de variáveis de ambiente.
    ///
    /// Variáveis suportadas:
    /// - `TRACER_TRACE_DIR`: diretório raiz dos runs
    /// - `TRACER_LENIENT`: "1" desliga o modo estrito
    /// - mais as variáveis de [`RecorderLimits`] e [`RedactionConfig`]
    pub fn from_env() -> Self {
        let mut config = Self {
            limits: RecorderLimits::from_env(),
            redaction: RedactionConfig::from_env(),
            ..Self::default()
        };

        if let Ok(dir) = std::env::var("TRACER_TRACE_DIR") {
            if !dir.is_empty() {
                config.base_dir = PathBuf::from(dir);
            }
        }

        if let Ok(v) = std::env::var("TRACER_LENIENT") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                config.strict = false;
            }
        }

        config
    }
}

/// Descrição do run entregue no `init` pela instrumentação.
#[derive(Debug, Clone)]
pub struct RunInfo {
    /// Versão do agente sendo gravado.
    pub agent_version: String,

    /// Identificador do modelo.
    pub llm: String,

    /// Temperatura de amostragem.
    pub temperature: f64,

    /// Seed de aleatoriedade.
    pub seed: i64,

    /// Ferramentas habilitadas.
    pub tools: Vec<String>,

    /// Tags livres gravadas nos metadados.
    pub tags: Vec<String>,
}

impl RunInfo {
    /// Descrição mínima, suficiente para testes e demos.
    pub fn new(agent_version: &str, llm: &str, seed: i64, tools: Vec<String>) -> Self {
        Self {
            agent_version: agent_version.to_string(),
            llm: llm.to_string(),
            temperature: 0.0,
            seed,
            tools,
            tags: Vec::new(),
        }
    }
}

// ============================================================================
// ESTADO INTERNO
// ============================================================================

/// Estados do ciclo de vida.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Sem run (handle desabilitado ou após criação leniente falha).
    Idle,
    /// Run aberto, aceitando instrumentação.
    Recording,
    /// Run selado; toda escrita é rejeitada.
    Sealed,
}

/// Estado mutável protegido pelo mutex do recorder.
#[derive(Debug)]
struct RecorderState {
    lifecycle: Lifecycle,
    store: Option<ArtifactStore>,
    /// Próximo id a atribuir na abertura de escopo.
    next_step_id: u64,
    /// Registros já anexados ao log.
    appended: u64,
    /// Step atualmente aberto, se houver.
    open_step: Option<u64>,
    /// Bytes já capturados (stdout, stderr) do step aberto.
    io_bytes: [u64; 2],
    /// Memória staged via `update_memory`, congelada no próximo fechamento.
    staged: Option<MemoryState>,
    /// Último estado persistido, base do próximo diff.
    prev_state: Option<MemoryState>,
}

struct RecorderInner {
    state: Mutex<RecorderState>,
    strict: bool,
    limits: RecorderLimits,
    redactor: Redactor,
    run_id: String,
    run_dir: PathBuf,
    /// Este handle detém a flag global de run ativo?
    owns_process_flag: bool,
    /// A flag global já foi liberada por este handle?
    flag_released: AtomicBool,
    /// Bytes de I/O descartados (step fechado ou teto atingido).
    discarded_io: AtomicU64,
}

impl RecorderInner {
    /// Libera a flag global exatamente uma vez, para não derrubar um
    /// run iniciado depois deste.
    fn release_flag(&self) {
        if self.owns_process_flag && !self.flag_released.swap(true, Ordering::SeqCst) {
            PROCESS_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for RecorderInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderInner")
            .field("run_id", &self.run_id)
            .field("strict", &self.strict)
            .finish()
    }
}

impl Drop for RecorderInner {
    fn drop(&mut self) {
        // Último handle sumiu com o run aberto: sela como aborted para
        // não deixar artefato órfão sem status terminal.
        let mut st = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if st.lifecycle == Lifecycle::Recording {
            warn!(run_id = %self.run_id, "Recorder dropped while recording; sealing as aborted");
            if let Some(store) = st.store.as_mut() {
                let _ = store.seal(
                    RunStatus::Aborted,
                    Some("recorder dropped".into()),
                    false,
                );
            }
            st.lifecycle = Lifecycle::Sealed;
        }
        drop(st);
        self.release_flag();
    }
}

// ============================================================================
// RECORDER
// ============================================================================

/// Estatísticas de gravação de um recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderStats {
    /// Registros anexados ao log até agora.
    pub steps_recorded: u64,

    /// Bytes de I/O descartados fora de um step aberto ou acima do teto.
    pub discarded_io_bytes: u64,
}

/// Handle do recorder. Clonável e barato; todos os clones compartilham
/// o mesmo run.
#[derive(Debug, Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    /// Abre um novo run e transiciona para `recording`.
    ///
    /// Aloca um identificador de run (UUID v4), cria o diretório em
    /// `config.base_dir/<run_id>` e grava os metadados iniciais.
    ///
    /// Um segundo `init` sem `stop` no mesmo processo:
    /// - modo estrito: `AlreadyActive`
    /// - modo leniente: retorna um handle desabilitado que descarta tudo
    pub fn init(config: RecorderConfig, info: RunInfo) -> TraceResult<Self> {
        if PROCESS_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if config.strict {
                return Err(TraceError::AlreadyActive);
            }
            warn!("init com run já ativo; retornando handle desabilitado (modo leniente)");
            return Ok(Self::disabled(&config));
        }

        let run_id = Uuid::new_v4().to_string();
        let run_dir = config.base_dir.join(&run_id);

        let meta = RunMeta {
            run_id: run_id.clone(),
            agent_version: info.agent_version,
            llm: info.llm,
            temperature: info.temperature,
            tools: info.tools,
            seed: info.seed,
            created_at: Utc::now().to_rfc3339(),
            status: RunStatus::Running,
            termination_reason: None,
            truncated: false,
            tags: info.tags,
            steps_digest: None,
            extra: Map::new(),
        };

        let redactor = match Redactor::new(&config.redaction) {
            Ok(r) => r,
            Err(e) => {
                PROCESS_ACTIVE.store(false, Ordering::SeqCst);
                return Err(TraceError::InvalidArtifact {
                    path: run_dir.display().to_string(),
                    detail: format!("padrão de redação inválido: {}", e),
                });
            }
        };

        let store = match ArtifactStore::create(&run_dir, meta) {
            Ok(s) => s,
            Err(e) => {
                PROCESS_ACTIVE.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(run_id = %run_id, run_dir = %run_dir.display(), "Run initialized");

        Ok(Self {
            inner: Arc::new(RecorderInner {
                state: Mutex::new(RecorderState {
                    lifecycle: Lifecycle::Recording,
                    store: Some(store),
                    next_step_id: 1,
                    appended: 0,
                    open_step: None,
                    io_bytes: [0, 0],
                    staged: None,
                    prev_state: None,
                }),
                strict: config.strict,
                limits: config.limits,
                redactor,
                run_id,
                run_dir,
                owns_process_flag: true,
                flag_released: AtomicBool::new(false),
                discarded_io: AtomicU64::new(0),
            }),
        })
    }

    /// Handle desabilitado: estado `idle`, toda chamada é descartada.
    fn disabled(config: &RecorderConfig) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                state: Mutex::new(RecorderState {
                    lifecycle: Lifecycle::Idle,
                    store: None,
                    next_step_id: 1,
                    appended: 0,
                    open_step: None,
                    io_bytes: [0, 0],
                    staged: None,
                    prev_state: None,
                }),
                strict: config.strict,
                limits: config.limits.clone(),
                redactor: Redactor::new(&RedactionConfig::default())
                    .expect("padrões de redação default compilam"),
                run_id: String::new(),
                run_dir: PathBuf::new(),
                owns_process_flag: false,
                flag_released: AtomicBool::new(false),
                discarded_io: AtomicU64::new(0),
            }),
        }
    }

    /// Identificador do run ("" em handle desabilitado).
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Diretório do run.
    pub fn run_dir(&self) -> &Path {
        &self.inner.run_dir
    }

    /// Indica se o handle está em `recording`.
    pub fn is_recording(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Recording
    }

    /// Estatísticas correntes.
    pub fn stats(&self) -> RecorderStats {
        let st = self.lock();
        RecorderStats {
            steps_recorded: st.appended,
            discarded_io_bytes: self.inner.discarded_io.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Abre um escopo de step e reserva o próximo identificador.
    ///
    /// Erros possíveis (modo estrito): `NoActiveRun` em idle, `Sealed`
    /// após o seal, `NestedStep` com outro escopo aberto. Em modo
    /// leniente todos viram um escopo desabilitado que descarta tudo.
    pub fn step(&self, phase: Phase, input: Map<String, Value>) -> TraceResult<StepScope> {
        let mut st = self.lock();
        match st.lifecycle {
            Lifecycle::Idle => {
                if self.inner.strict {
                    Err(TraceError::NoActiveRun)
                } else {
                    Ok(StepScope::disabled(phase))
                }
            }
            Lifecycle::Sealed => {
                if self.inner.strict {
                    Err(TraceError::Sealed {
                        run_id: self.inner.run_id.clone(),
                    })
                } else {
                    warn!(run_id = %self.inner.run_id, "step após seal descartado (modo leniente)");
                    Ok(StepScope::disabled(phase))
                }
            }
            Lifecycle::Recording => {
                if let Some(open) = st.open_step {
                    if self.inner.strict {
                        return Err(TraceError::NestedStep { open_step: open });
                    }
                    warn!(open_step = open, "step aninhado descartado (modo leniente)");
                    return Ok(StepScope::disabled(phase));
                }
                let id = st.next_step_id;
                st.next_step_id += 1;
                st.open_step = Some(id);
                st.io_bytes = [0, 0];
                debug!(run_id = %self.inner.run_id, step_id = id, phase = phase.as_str(), "Step opened");
                Ok(StepScope {
                    inner: Some(self.inner.clone()),
                    step_id: id,
                    phase,
                    input,
                    output: Map::new(),
                    extra: Map::new(),
                    status: StepStatus::Ok,
                    opened_at: Instant::now(),
                    closed: false,
                })
            }
        }
    }

    /// Prepara o snapshot que será congelado no próximo fechamento.
    pub fn update_memory(&self, state: MemoryState) -> TraceResult<()> {
        let mut st = self.lock();
        match st.lifecycle {
            Lifecycle::Recording => {
                st.staged = Some(state);
                Ok(())
            }
            Lifecycle::Idle if !self.inner.strict => Ok(()),
            Lifecycle::Idle => Err(TraceError::NoActiveRun),
            Lifecycle::Sealed if !self.inner.strict => Ok(()),
            Lifecycle::Sealed => Err(TraceError::Sealed {
                run_id: self.inner.run_id.clone(),
            }),
        }
    }

    /// Sela o run e transiciona para `sealed`.
    ///
    /// O status terminal deriva do motivo: "success" → `success`,
    /// "failure"/"error" → `failure`, "limit_exceeded" →
    /// `limit_exceeded`, qualquer outro → `aborted`.
    pub fn stop(&self, reason: &str) -> TraceResult<()> {
        let status = match reason {
            "success" => RunStatus::Success,
            "failure" | "error" => RunStatus::Failure,
            "limit_exceeded" => RunStatus::LimitExceeded,
            _ => RunStatus::Aborted,
        };

        let mut st = self.lock();
        match st.lifecycle {
            Lifecycle::Recording => {
                if let Some(store) = st.store.as_mut() {
                    store.seal(status, Some(reason.to_string()), false)?;
                }
                st.lifecycle = Lifecycle::Sealed;
                drop(st);
                self.inner.release_flag();
                info!(run_id = %self.inner.run_id, reason, "Run stopped");
                Ok(())
            }
            Lifecycle::Idle if !self.inner.strict => Ok(()),
            Lifecycle::Idle => Err(TraceError::NoActiveRun),
            Lifecycle::Sealed if !self.inner.strict => Ok(()),
            Lifecycle::Sealed => Err(TraceError::Sealed {
                run_id: self.inner.run_id.clone(),
            }),
        }
    }

    /// Handle de captura de I/O ligado ao step aberto no momento da
    /// escrita. Bytes fora de um step aberto são descartados e contados.
    pub fn io_handle(&self, stream: IoStream) -> ToolIoHandle {
        ToolIoHandle {
            inner: self.inner.clone(),
            stream,
        }
    }
}

// ============================================================================
// ESCOPO DE STEP
// ============================================================================

/// Contexto mutável de um step aberto.
///
/// O escopo garante registro em todos os caminhos de saída:
/// - [`StepScope::finish`] fecha com o status corrente (default `ok`)
/// - [`StepScope::fail`] fecha com `status=error` e a causa no output
/// - drop sem fechamento explícito (cancelamento) fecha com
///   `status=error` e a causa de cancelamento no output
#[derive(Debug)]
pub struct StepScope {
    /// `None` = escopo desabilitado (modo leniente): descarta tudo.
    inner: Option<Arc<RecorderInner>>,
    step_id: u64,
    phase: Phase,
    input: Map<String, Value>,
    output: Map<String, Value>,
    extra: Map<String, Value>,
    status: StepStatus,
    opened_at: Instant,
    closed: bool,
}

impl StepScope {
    fn disabled(phase: Phase) -> Self {
        Self {
            inner: None,
            step_id: 0,
            phase,
            input: Map::new(),
            output: Map::new(),
            extra: Map::new(),
            status: StepStatus::Ok,
            opened_at: Instant::now(),
            closed: false,
        }
    }

    /// Identificador atribuído a este step (0 em escopo desabilitado).
    pub fn step_id(&self) -> u64 {
        self.step_id
    }

    /// Fase do step.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Define uma chave do payload de saída.
    pub fn set_output(&mut self, key: &str, value: Value) {
        self.output.insert(key.to_string(), value);
    }

    /// Substitui o payload de saída inteiro.
    pub fn set_output_map(&mut self, output: Map<String, Value>) {
        self.output = output;
    }

    /// Define o status do step.
    pub fn set_status(&mut self, status: StepStatus) {
        self.status = status;
    }

    /// Anexa um campo extra ao registro (ex: marcação de replay).
    pub fn annotate(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_string(), value);
    }

    /// Retipa a fase antes do fechamento.
    ///
    /// Usado pelo wrapper de ferramenta para transformar a tentativa
    /// falha em um step de fase `retry`.
    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Fecha o escopo com o status corrente.
    pub fn finish(mut self) -> TraceResult<()> {
        self.closed = true;
        self.close_now()
    }

    /// Fecha o escopo como falha, com a causa no payload de saída.
    pub fn fail(mut self, cause: &str) -> TraceResult<()> {
        self.status = StepStatus::Error;
        self.output
            .insert("error".to_string(), Value::String(cause.to_string()));
        self.closed = true;
        self.close_now()
    }

    fn close_now(&mut self) -> TraceResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        close_step(
            &inner,
            self.step_id,
            self.phase,
            std::mem::take(&mut self.input),
            std::mem::take(&mut self.output),
            std::mem::take(&mut self.extra),
            self.status,
            self.opened_at,
        )
    }
}

impl Drop for StepScope {
    fn drop(&mut self) {
        if self.closed || self.inner.is_none() {
            return;
        }
        // Escopo cancelado por sinal externo (drop do future, panic do
        // chamador): fecha como erro com a causa registrada.
        self.status = StepStatus::Error;
        self.output.entry("error".to_string()).or_insert_with(|| {
            Value::String("escopo de step cancelado antes do fechamento".to_string())
        });
        if let Err(e) = self.close_now() {
            warn!(step_id = self.step_id, error = %e, "Falha ao registrar step cancelado");
        }
    }
}

/// Fechamento de um step: redação, snapshot, diff, append e limites.
#[allow(clippy::too_many_arguments)]
fn close_step(
    inner: &Arc<RecorderInner>,
    step_id: u64,
    phase: Phase,
    input: Map<String, Value>,
    output: Map<String, Value>,
    extra: Map<String, Value>,
    status: StepStatus,
    opened_at: Instant,
) -> TraceResult<()> {
    let mut st = match inner.state.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    st.open_step = None;

    if st.lifecycle != Lifecycle::Recording {
        // stop() no meio de um escopo aberto: nada mais a registrar.
        return if inner.strict {
            Err(TraceError::Sealed {
                run_id: inner.run_id.clone(),
            })
        } else {
            Ok(())
        };
    }

    let timestamp = Utc::now().timestamp_millis();
    let duration_ms = opened_at.elapsed().as_millis() as u64;

    // Redação antes de qualquer serializador ver o payload.
    let input = inner.redactor.redact_map(&input);
    let output = inner.redactor.redact_map(&output);

    // Memória staged congela aqui; sem staged, o estado anterior segue.
    let state_now = st
        .staged
        .take()
        .or_else(|| st.prev_state.clone())
        .unwrap_or_default();

    let reaches_limit = st.appended + 1 >= inner.limits.max_steps;

    let record = if reaches_limit && phase != Phase::Terminate {
        // O slot final é do terminate: o step do usuário é descartado e
        // o run sela truncado.
        warn!(
            run_id = %inner.run_id,
            step_id,
            max_steps = inner.limits.max_steps,
            "Limite de steps atingido; gravando terminate e selando"
        );
        let mut out = Map::new();
        out.insert("reason".into(), Value::String("limit_exceeded".into()));
        out.insert("max_steps".into(), Value::from(inner.limits.max_steps));
        out.insert("dropped_phase".into(), Value::String(phase.as_str().into()));
        StepRecord {
            step_id,
            timestamp,
            phase: Phase::Terminate,
            input: Map::new(),
            output: out,
            state_ref: snapshot_rel_path(step_id),
            diff_ref: None,
            status: StepStatus::Ok,
            duration_ms: None,
            extra: Map::new(),
        }
    } else {
        StepRecord {
            step_id,
            timestamp,
            phase,
            input,
            output,
            state_ref: snapshot_rel_path(step_id),
            diff_ref: None,
            status,
            duration_ms: Some(duration_ms),
            extra,
        }
    };

    let mut record = record;
    {
        let store = st.store.as_ref().ok_or(TraceError::NoActiveRun)?;

        // Snapshot antes do registro: leitor que vê o step confia no
        // sidecar.
        let snapshot = Snapshot {
            step_id,
            state: state_now.clone(),
        };
        store.write_snapshot(&snapshot)?;

        if let Some(prev) = &st.prev_state {
            let delta = diff::compute(step_id, prev, &state_now);
            if !delta.changes.is_empty() {
                store.write_diff(&delta)?;
                record.diff_ref = Some(protocol::diff_rel_path(step_id));
            }
        }
    }

    st.store
        .as_mut()
        .ok_or(TraceError::NoActiveRun)?
        .append_step(&record)?;
    st.appended = step_id;
    st.prev_state = Some(state_now);

    debug!(
        run_id = %inner.run_id,
        step_id,
        phase = record.phase.as_str(),
        status = ?record.status,
        "Step recorded"
    );

    if reaches_limit {
        st.store
            .as_mut()
            .ok_or(TraceError::NoActiveRun)?
            .seal(
                RunStatus::LimitExceeded,
                Some("limit_exceeded".into()),
                true,
            )?;
        st.lifecycle = Lifecycle::Sealed;
        drop(st);
        inner.release_flag();
        if inner.strict && phase != Phase::Terminate {
            return Err(TraceError::LimitExceeded {
                max_steps: inner.limits.max_steps,
            });
        }
    }

    Ok(())
}

// ============================================================================
// CANAL DE I/O DE FERRAMENTA
// ============================================================================

/// Handle de captura de um stream de I/O.
///
/// Cada escrita é atribuída ao step aberto NO MOMENTO da escrita; bytes
/// produzidos depois do fechamento são descartados com contador de
/// aviso, nunca anexados ao step errado.
#[derive(Debug, Clone)]
pub struct ToolIoHandle {
    inner: Arc<RecorderInner>,
    stream: IoStream,
}

impl ToolIoHandle {
    /// Captura bytes para o step aberto, respeitando o teto por stream.
    pub fn write(&self, bytes: &[u8]) {
        let mut st = match self.inner.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let open = match (st.lifecycle, st.open_step) {
            (Lifecycle::Recording, Some(id)) => id,
            _ => {
                self.inner
                    .discarded_io
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                warn!(
                    stream = self.stream.as_str(),
                    bytes = bytes.len(),
                    "I/O de ferramenta fora de step aberto; descartando"
                );
                return;
            }
        };

        let idx = match self.stream {
            IoStream::Stdout => 0,
            IoStream::Stderr => 1,
        };
        let written = st.io_bytes[idx];
        let budget = self.inner.limits.max_io_bytes.saturating_sub(written);
        let allowed = bytes.len().min(budget as usize);

        if allowed < bytes.len() {
            let dropped = (bytes.len() - allowed) as u64;
            self.inner
                .discarded_io
                .fetch_add(dropped, Ordering::Relaxed);
            warn!(
                stream = self.stream.as_str(),
                dropped,
                "Teto de I/O por stream atingido; descartando excedente"
            );
        }

        if allowed == 0 {
            return;
        }

        st.io_bytes[idx] = written + allowed as u64;
        if let Some(store) = st.store.as_ref() {
            if let Err(e) = store.capture_tool_io(open, self.stream, &bytes[..allowed]) {
                warn!(step_id = open, error = %e, "Falha ao capturar I/O de ferramenta");
            }
        }
    }
}

// ============================================================================
// UTILITÁRIO DE TESTE
// ============================================================================

#[cfg(test)]
pub(crate) mod testutil {
    //! A flag de run ativo é global ao processo; testes que chamam
    //! `init` serializam por este mutex para não verem `AlreadyActive`
    //! uns dos outros.

    use once_cell::sync::Lazy;
    use std::sync::{Mutex, MutexGuard};

    static GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub fn exclusive() -> MutexGuard<'static, ()> {
        match GUARD.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> RecorderConfig {
        RecorderConfig {
            base_dir: tmp.path().to_path_buf(),
            strict: true,
            ..RecorderConfig::default()
        }
    }

    fn input(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_happy_path_records_reason_and_tool() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(
            config(&tmp),
            RunInfo::new("1", "m", 0, vec!["s".into()]),
        )
        .unwrap();

        let mut scope = rec.step(Phase::Reason, input(json!({"p": "hi"}))).unwrap();
        scope.set_output("r", json!("ok"));
        scope.finish().unwrap();

        let mut scope = rec
            .step(Phase::Tool, input(json!({"tool": "s", "args": {"q": 1}})))
            .unwrap();
        scope.set_output("result", json!("R"));
        scope.finish().unwrap();

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.steps[0].phase, Phase::Reason);
        assert_eq!(run.steps[1].phase, Phase::Tool);
        assert_eq!(run.meta.status, RunStatus::Success);
        assert!(!run.partial);
        assert!(run.load_snapshot(1).unwrap().is_some());
        assert!(run.load_snapshot(2).unwrap().is_some());
        // Duração sempre medida do relógio de parede.
        assert!(run.steps[0].duration_ms.is_some());
    }

    #[test]
    fn test_redaction_applied_before_persistence() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(
            config(&tmp),
            RunInfo::new("1", "m", 0, vec![]),
        )
        .unwrap();

        let scope = rec
            .step(
                Phase::Reason,
                input(json!({"api_key": "sk-ABCDEFGHIJKLMNOPQRSTUV"})),
            )
            .unwrap();
        scope.finish().unwrap();

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(run.steps[0].input["api_key"], "********");
        let raw = std::fs::read_to_string(dir.join("steps.jsonl")).unwrap();
        assert!(!raw.contains("sk-ABCDEFGHIJKLMNOPQRSTUV"));
    }

    #[test]
    fn test_limit_truncation_writes_terminate() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.strict = false;
        cfg.limits = RecorderLimits::with_max_steps(3);
        let rec = Recorder::init(cfg, RunInfo::new("1", "m", 0, vec![])).unwrap();

        for i in 0..4 {
            let scope = rec
                .step(Phase::Observe, input(json!({"i": i})))
                .unwrap();
            let _ = scope.finish();
        }

        let dir = rec.run_dir().to_path_buf();
        drop(rec);

        let run = store::load(&dir).unwrap();
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.steps[2].phase, Phase::Terminate);
        assert!(run.meta.truncated);
        assert_eq!(
            run.meta.termination_reason.as_deref(),
            Some("limit_exceeded")
        );
        assert_eq!(run.meta.status, RunStatus::LimitExceeded);
    }

    #[test]
    fn test_nested_step_rejected_in_strict_mode() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(config(&tmp), RunInfo::new("1", "m", 0, vec![])).unwrap();

        let _outer = rec.step(Phase::Reason, Map::new()).unwrap();
        let err = rec.step(Phase::Tool, Map::new()).unwrap_err();
        assert!(matches!(err, TraceError::NestedStep { open_step: 1 }));
    }

    #[test]
    fn test_second_init_is_already_active() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(config(&tmp), RunInfo::new("1", "m", 0, vec![])).unwrap();

        let err = Recorder::init(config(&tmp), RunInfo::new("1", "m", 0, vec![])).unwrap_err();
        assert!(matches!(err, TraceError::AlreadyActive));

        rec.stop("success").unwrap();

        // Após stop, novo init volta a funcionar.
        let rec2 = Recorder::init(config(&tmp), RunInfo::new("2", "m", 0, vec![])).unwrap();
        rec2.stop("success").unwrap();
    }

    #[test]
    fn test_lenient_second_init_is_noop_handle() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.strict = false;
        let rec = Recorder::init(cfg.clone(), RunInfo::new("1", "m", 0, vec![])).unwrap();

        let second = Recorder::init(cfg, RunInfo::new("1", "m", 0, vec![])).unwrap();
        assert!(!second.is_recording());
        // Instrumentação no handle desabilitado é descartada sem erro.
        let scope = second.step(Phase::Reason, Map::new()).unwrap();
        scope.finish().unwrap();
        second.stop("success").unwrap();

        // O run original continua funcional.
        assert!(rec.is_recording());
        rec.stop("success").unwrap();
    }

    #[test]
    fn test_strict_instrumentation_without_init_fails() {
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::disabled(&config(&tmp));
        // Handle em idle: NoActiveRun em modo estrito.
        let err = rec.step(Phase::Reason, Map::new()).unwrap_err();
        assert!(matches!(err, TraceError::NoActiveRun));
        let err = rec.update_memory(MemoryState::default()).unwrap_err();
        assert!(matches!(err, TraceError::NoActiveRun));
        let err = rec.stop("success").unwrap_err();
        assert!(matches!(err, TraceError::NoActiveRun));
    }

    #[test]
    fn test_cancelled_scope_records_error_step() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(config(&tmp), RunInfo::new("1", "m", 0, vec![])).unwrap();

        {
            let _scope = rec.step(Phase::Tool, input(json!({"tool": "s"}))).unwrap();
            // Drop sem finish: cancelamento.
        }

        let dir = rec.run_dir().to_path_buf();
        rec.stop("aborted by test").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].status, StepStatus::Error);
        assert!(run.steps[0].output["error"]
            .as_str()
            .unwrap()
            .contains("cancelado"));
    }

    #[test]
    fn test_update_memory_snapshot_and_diff() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(config(&tmp), RunInfo::new("1", "m", 0, vec![])).unwrap();

        let mut state = MemoryState::default();
        state.context_tokens = 10;
        rec.update_memory(state).unwrap();
        rec.step(Phase::Reason, Map::new()).unwrap().finish().unwrap();

        let mut state = MemoryState::default();
        state.context_tokens = 20;
        rec.update_memory(state).unwrap();
        rec.step(Phase::Observe, Map::new()).unwrap().finish().unwrap();

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        let snap1 = run.load_snapshot(1).unwrap().unwrap();
        let snap2 = run.load_snapshot(2).unwrap().unwrap();
        assert_eq!(snap1.state.context_tokens, 10);
        assert_eq!(snap2.state.context_tokens, 20);

        // Diff do step 2 aplicado ao snapshot 1 reconstrói o snapshot 2.
        assert!(run.steps[0].diff_ref.is_none());
        assert!(run.steps[1].diff_ref.is_some());
        let delta = run.load_diff(2).unwrap().unwrap();
        let rebuilt = crate::diff::apply(&snap1.state, &delta).unwrap();
        assert_eq!(rebuilt, snap2.state);
    }

    #[test]
    fn test_io_after_close_is_discarded_with_counter() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(config(&tmp), RunInfo::new("1", "m", 0, vec![])).unwrap();
        let io = rec.io_handle(IoStream::Stdout);

        let scope = rec.step(Phase::Tool, input(json!({"tool": "s"}))).unwrap();
        io.write(b"dentro");
        scope.finish().unwrap();

        // Step fechado: bytes tardios são descartados, não anexados.
        io.write(b"tarde demais");
        assert_eq!(rec.stats().discarded_io_bytes, b"tarde demais".len() as u64);

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(
            run.load_tool_io(1, IoStream::Stdout).unwrap().unwrap(),
            b"dentro"
        );
    }

    #[test]
    fn test_io_cap_per_stream() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.limits.max_io_bytes = 4;
        let rec = Recorder::init(cfg, RunInfo::new("1", "m", 0, vec![])).unwrap();
        let io = rec.io_handle(IoStream::Stderr);

        let scope = rec.step(Phase::Tool, input(json!({"tool": "s"}))).unwrap();
        io.write(b"123456");
        scope.finish().unwrap();

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        assert_eq!(
            run.load_tool_io(1, IoStream::Stderr).unwrap().unwrap(),
            b"1234"
        );
        assert_eq!(rec.stats().discarded_io_bytes, 2);
    }

    #[test]
    fn test_step_ids_are_contiguous() {
        let _guard = testutil::exclusive();
        let tmp = TempDir::new().unwrap();
        let rec = Recorder::init(config(&tmp), RunInfo::new("1", "m", 0, vec![])).unwrap();

        for _ in 0..5 {
            rec.step(Phase::Observe, Map::new()).unwrap().finish().unwrap();
        }

        let dir = rec.run_dir().to_path_buf();
        rec.stop("success").unwrap();

        let run = store::load(&dir).unwrap();
        let ids: Vec<u64> = run.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }
}
