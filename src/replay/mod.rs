//! # Módulo do Motor de Replay
//!
//! Reproduz a execução de um agente a partir dos artefatos, com **zero
//! efeitos externos**: nenhum modelo é chamado, nenhuma ferramenta roda.
//!
//! ## Para todos entenderem:
//!
//! O replay é como reencenar uma peça com o roteiro na mão. O agente
//! (ou o roteirista embutido) pede "fala do modelo" ou "resultado da
//! ferramenta X", e o motor responde lendo a próxima fala gravada.
//! Se o agente pede algo fora da ordem do roteiro, isso é uma
//! **divergência** - anotada no relatório, nunca um abort no meio.
//!
//! ## Semântica do cursor:
//!
//! O casamento é por fase e nome de ferramenta, NUNCA por step_id -
//! assim pequenas reordenações do agente sob replay são detectadas como
//! divergência em vez de silenciosamente ignoradas.
//!
//! - steps `retry` são invisíveis ao replay (pulados e consumidos)
//! - steps `observe`/`memory`/`terminate` não são alvo de casamento
//! - pedido além do gravado → `extra_step` (cursor esgotado)
//! - gravado sem pedido correspondente → `missing_step`
//! - fase ou ferramenta errada na posição → `output_mismatch`
//!
//! ## Trace de replay:
//!
//! O motor dirige um recorder secundário que regrava cada step original
//! verbatim (fase, input, output, snapshot), anotado com `replayed` e o
//! id de origem. O run resultante carrega as tags
//! `["replay", "source:<run_id>"]`.
//!
//! ## Comparação final:
//!
//! Ao término, campos-chave do snapshot final (status, contador de
//! steps, goal, tokens de contexto) são comparados e qualquer diferença
//! vira `state_mismatch`.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{TraceError, TraceResult};
use crate::protocol::{Phase, StepRecord};
use crate::recorder::{Recorder, RecorderConfig, RunInfo};
use crate::store::{self, LoadedRun};

// ============================================================================
// TAXONOMIA DE DIVERGÊNCIA
// ============================================================================

/// Tipos de divergência detectáveis durante o replay.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// Campo do snapshot final difere.
    StateMismatch,
    /// Fase ou ferramenta pedida não casa com a ordem gravada.
    OutputMismatch,
    /// O agente fez menos chamadas do que o gravado.
    MissingStep,
    /// O agente fez mais chamadas do que o gravado.
    ExtraStep,
}

/// Uma divergência observada, com contexto legível.
#[derive(Debug, Clone, Serialize)]
pub struct Divergence {
    /// Tipo da divergência.
    pub kind: DivergenceKind,

    /// Step original associado, quando há um.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u64>,

    /// Descrição legível do que divergiu.
    pub detail: String,
}

/// Relatório final de um replay.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Run que serviu de roteiro.
    pub source_run_id: String,

    /// Run de replay produzido.
    pub replay_run_id: String,

    /// Diretório do run de replay.
    pub replay_dir: PathBuf,

    /// Steps regravados no trace de replay.
    pub steps_replayed: usize,

    /// Divergências acumuladas, na ordem de detecção.
    pub divergences: Vec<Divergence>,
}

impl ReplayReport {
    /// Replay limpo: nenhuma divergência observada.
    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty()
    }
}

// ============================================================================
// ENDPOINTS SUBSTITUTOS
// ============================================================================

/// Estado compartilhado do cursor sobre a sequência gravada.
#[derive(Debug)]
struct CursorState {
    steps: Vec<StepRecord>,
    pos: usize,
    divergences: Vec<Divergence>,
}

/// Endpoints substitutos de modelo e ferramenta apresentados ao agente.
///
/// Não executam nada: consomem a sequência gravada e devolvem os
/// outputs registrados, na ordem.
#[derive(Debug)]
pub struct ReplayEndpoints {
    state: Mutex<CursorState>,
}

impl ReplayEndpoints {
    /// Cria endpoints sobre a sequência de steps de um run.
    pub fn new(steps: Vec<StepRecord>) -> Self {
        Self {
            state: Mutex::new(CursorState {
                steps,
                pos: 0,
                divergences: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CursorState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Avança o cursor até o próximo step casável (`reason` ou `tool`),
    /// consumindo os invisíveis no caminho.
    fn advance(st: &mut CursorState) -> Option<usize> {
        while st.pos < st.steps.len() {
            let idx = st.pos;
            match st.steps[idx].phase {
                Phase::Reason | Phase::Tool => return Some(idx),
                // retry é invisível; observe/memory/terminate não são
                // alvo de casamento.
                _ => st.pos += 1,
            }
        }
        None
    }

    /// Endpoint de modelo: devolve o output do próximo step `reason`.
    ///
    /// O output inclui qualquer hint de ação que o modelo gravado
    /// tenha produzido.
    pub fn next_reason(&self, _prompt: &Value) -> TraceResult<Map<String, Value>> {
        let mut st = self.lock();
        let Some(idx) = Self::advance(&mut st) else {
            let last = st.steps.last().map(|s| s.step_id).unwrap_or(0);
            st.divergences.push(Divergence {
                kind: DivergenceKind::ExtraStep,
                step_id: None,
                detail: "agente pediu uma chamada de modelo além do gravado".into(),
            });
            return Err(TraceError::CursorExhausted { last_step: last });
        };

        let step = st.steps[idx].clone();
        st.pos = idx + 1;

        if step.phase != Phase::Reason {
            let recorded = format!(
                "tool:{}",
                step.tool_name().unwrap_or("?")
            );
            st.divergences.push(Divergence {
                kind: DivergenceKind::OutputMismatch,
                step_id: Some(step.step_id),
                detail: format!(
                    "agente pediu modelo mas o step {} gravado é {}",
                    step.step_id, recorded
                ),
            });
            return Err(TraceError::ToolMismatch {
                recorded,
                requested: "reason".into(),
            });
        }

        debug!(step_id = step.step_id, "Replay served reason step");
        Ok(step.output)
    }

    /// Endpoint de ferramenta: devolve o output do próximo step `tool`
    /// se o nome pedido casa com o gravado naquela posição.
    pub fn next_tool(&self, name: &str, _args: &Value) -> TraceResult<Map<String, Value>> {
        let mut st = self.lock();
        let Some(idx) = Self::advance(&mut st) else {
            let last = st.steps.last().map(|s| s.step_id).unwrap_or(0);
            st.divergences.push(Divergence {
                kind: DivergenceKind::ExtraStep,
                step_id: None,
                detail: format!(
                    "agente pediu a ferramenta '{}' além do gravado",
                    name
                ),
            });
            return Err(TraceError::CursorExhausted { last_step: last });
        };

        let step = st.steps[idx].clone();
        // Consome mesmo em mismatch: uma chamada errada não pode
        // encravar o cursor.
        st.pos = idx + 1;

        if step.phase != Phase::Tool {
            st.divergences.push(Divergence {
                kind: DivergenceKind::OutputMismatch,
                step_id: Some(step.step_id),
                detail: format!(
                    "agente pediu a ferramenta '{}' mas o step {} gravado é reason",
                    name, step.step_id
                ),
            });
            return Err(TraceError::ToolMismatch {
                recorded: "reason".into(),
                requested: name.into(),
            });
        }

        let recorded = step.tool_name().unwrap_or("").to_string();
        if recorded != name {
            st.divergences.push(Divergence {
                kind: DivergenceKind::OutputMismatch,
                step_id: Some(step.step_id),
                detail: format!(
                    "step {} gravou a ferramenta '{}' mas o agente pediu '{}'",
                    step.step_id, recorded, name
                ),
            });
            return Err(TraceError::ToolMismatch {
                recorded,
                requested: name.into(),
            });
        }

        debug!(step_id = step.step_id, tool = name, "Replay served tool step");
        Ok(step.output)
    }

    /// Consome o estado final: divergências + steps casáveis não
    /// consumidos (cada um vira `missing_step`).
    fn into_findings(self) -> Vec<Divergence> {
        let mut st = match self.state.into_inner() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut divergences = std::mem::take(&mut st.divergences);
        for step in st.steps.iter().skip(st.pos) {
            if matches!(step.phase, Phase::Reason | Phase::Tool) {
                divergences.push(Divergence {
                    kind: DivergenceKind::MissingStep,
                    step_id: Some(step.step_id),
                    detail: format!(
                        "step {} ({}) gravado mas nunca pedido pelo agente",
                        step.step_id,
                        step.phase.as_str()
                    ),
                });
            }
        }
        divergences
    }
}

// ============================================================================
// AGENTE SOB REPLAY
// ============================================================================

/// Contrato do agente dirigido contra os endpoints substitutos.
#[async_trait]
pub trait ReplayAgent: Send {
    /// Executa a lógica do agente consumindo apenas os endpoints.
    async fn drive(&mut self, endpoints: &ReplayEndpoints) -> anyhow::Result<()>;
}

/// Roteirista embutido: reemite exatamente as chamadas gravadas.
///
/// É o agente usado pelo `replay` da CLI - replay de um run não
/// modificado contra si mesmo deve produzir zero divergências.
pub struct RecordedScript {
    steps: Vec<StepRecord>,
}

impl RecordedScript {
    /// Constrói o roteiro a partir de um run carregado.
    pub fn from_run(run: &LoadedRun) -> Self {
        Self {
            steps: run.steps.clone(),
        }
    }
}

#[async_trait]
impl ReplayAgent for RecordedScript {
    async fn drive(&mut self, endpoints: &ReplayEndpoints) -> anyhow::Result<()> {
        for step in &self.steps {
            match step.phase {
                Phase::Reason => {
                    let prompt = step
                        .input
                        .get("prompt")
                        .cloned()
                        .unwrap_or(Value::Null);
                    // Divergência já registrada pelo endpoint; o
                    // roteirista segue o roteiro até o fim.
                    let _ = endpoints.next_reason(&prompt);
                }
                Phase::Tool => {
                    let name = step.tool_name().unwrap_or("").to_string();
                    let args = step.input.get("args").cloned().unwrap_or(Value::Null);
                    let _ = endpoints.next_tool(&name, &args);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// MOTOR DE REPLAY
// ============================================================================

/// Motor de replay: dirige o agente, regrava o trace e compara.
pub struct ReplayEngine {
    config: RecorderConfig,
}

impl ReplayEngine {
    /// Cria o motor; `config.base_dir` recebe os runs de replay.
    pub fn new(config: RecorderConfig) -> Self {
        Self { config }
    }

    /// Replay de um run contra o roteirista embutido (identidade).
    pub async fn replay_identity(&self, source: &LoadedRun) -> TraceResult<ReplayReport> {
        let mut script = RecordedScript::from_run(source);
        self.replay(source, &mut script).await
    }

    /// Replay de um run dirigindo um agente arbitrário.
    ///
    /// Nunca aborta por divergência: todas são acumuladas no relatório.
    pub async fn replay(
        &self,
        source: &LoadedRun,
        agent: &mut dyn ReplayAgent,
    ) -> TraceResult<ReplayReport> {
        info!(run_id = %source.meta.run_id, steps = source.steps.len(), "Replay starting");

        // Fase 1: dirige o agente contra os endpoints substitutos.
        let endpoints = ReplayEndpoints::new(source.steps.clone());
        if let Err(e) = agent.drive(&endpoints).await {
            warn!(error = %e, "Agente sob replay terminou com erro");
        }
        let mut divergences = endpoints.into_findings();

        // Fase 2: regrava o trace de replay verbatim, anotado.
        let info = RunInfo {
            agent_version: source.meta.agent_version.clone(),
            llm: source.meta.llm.clone(),
            temperature: source.meta.temperature,
            seed: source.meta.seed,
            tools: source.meta.tools.clone(),
            tags: vec![
                "replay".to_string(),
                format!("source:{}", source.meta.run_id),
            ],
        };
        let recorder = Recorder::init(self.config.clone(), info)?;
        let replay_run_id = recorder.run_id().to_string();
        let replay_dir = recorder.run_dir().to_path_buf();

        let mut replayed = 0usize;
        for step in &source.steps {
            if let Some(snapshot) = source.load_snapshot(step.step_id)? {
                recorder.update_memory(snapshot.state)?;
            }
            let mut scope = recorder.step(step.phase, step.input.clone())?;
            scope.set_output_map(step.output.clone());
            scope.set_status(step.status);
            scope.annotate("replayed", Value::Bool(true));
            scope.annotate("replay_of", Value::from(step.step_id));
            scope.finish()?;
            replayed += 1;
        }

        // Run truncado sela sozinho ao regravar o terminate.
        if recorder.is_recording() {
            let reason = source
                .meta
                .termination_reason
                .clone()
                .unwrap_or_else(|| "aborted".to_string());
            recorder.stop(&reason)?;
        }

        // Fase 3: comparação final de campos-chave do snapshot.
        let replay_run = store::load(&replay_dir)?;
        compare_final_state(source, &replay_run, &mut divergences)?;

        info!(
            replay_run_id = %replay_run_id,
            divergences = divergences.len(),
            "Replay finished"
        );

        Ok(ReplayReport {
            source_run_id: source.meta.run_id.clone(),
            replay_run_id,
            replay_dir,
            steps_replayed: replayed,
            divergences,
        })
    }
}

/// Compara os campos-chave do estado final entre original e replay.
fn compare_final_state(
    a: &LoadedRun,
    b: &LoadedRun,
    divergences: &mut Vec<Divergence>,
) -> TraceResult<()> {
    if a.steps.len() != b.steps.len() {
        divergences.push(Divergence {
            kind: DivergenceKind::StateMismatch,
            step_id: a.steps.last().map(|s| s.step_id),
            detail: format!(
                "contador de steps difere: original {} vs replay {}",
                a.steps.len(),
                b.steps.len()
            ),
        });
    }

    let (Some(sa), Some(sb)) = (a.final_snapshot()?, b.final_snapshot()?) else {
        // Run parcial sem snapshot de cauda: leitor tolera a ausência.
        return Ok(());
    };

    if sa.state.context_tokens != sb.state.context_tokens {
        divergences.push(Divergence {
            kind: DivergenceKind::StateMismatch,
            step_id: Some(sa.step_id),
            detail: format!(
                "context_tokens difere: original {} vs replay {}",
                sa.state.context_tokens, sb.state.context_tokens
            ),
        });
    }

    if sa.state.memory.len() != sb.state.memory.len() {
        divergences.push(Divergence {
            kind: DivergenceKind::StateMismatch,
            step_id: Some(sa.step_id),
            detail: format!(
                "tamanho da memória difere: original {} vs replay {}",
                sa.state.memory.len(),
                sb.state.memory.len()
            ),
        });
    }

    for field in ["status", "goal", "steps"] {
        let va = sa.state.tools_state.get(field);
        let vb = sb.state.tools_state.get(field);
        if va != vb {
            divergences.push(Divergence {
                kind: DivergenceKind::StateMismatch,
                step_id: Some(sa.step_id),
                detail: format!("campo final '{}' difere: {:?} vs {:?}", field, va, vb),
            });
        }
    }

    Ok(())
}

// ============================================================================
// TESTES
// ============================================================================
