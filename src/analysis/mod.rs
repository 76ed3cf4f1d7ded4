//! # Módulo de Análise - Kernel Puro
//!
//! Funções puras e reprodutíveis sobre um ou dois runs carregados:
//! mesmas entradas, mesmo relatório, sempre. O kernel relata achados,
//! nunca falha por causa deles.
//!
//! ## Para todos entenderem:
//!
//! Se o recorder é a câmera e o replay é a reencenação, a análise é o
//! perito que examina a fita:
//!
//! - **Alinhamento**: coloca dois runs lado a lado, step a step
//! - **Ponto de divergência**: o primeiro lugar onde as fitas diferem
//! - **Checks de invariante**: regras que toda execução deveria honrar
//! - **Rótulos semânticos**: etiquetas heurísticas por step
//! - **Causa raiz**: o primeiro erro e a cadeia que levou até ele
//!
//! Nada aqui muta artefatos; contrafactuais (que criam um run NOVO)
//! vivem no submódulo [`counterfactual`].

pub mod counterfactual;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::protocol::{Phase, StepStatus};
use crate::redaction::default_redactor;
use crate::store::LoadedRun;

// ============================================================================
// ALINHAMENTO DE STEPS (DOIS RUNS)
// ============================================================================

/// Qualidade do casamento em uma posição do alinhamento.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentKind {
    /// Fase e payload de entrada estruturalmente iguais.
    Exact,
    /// Mesma fase, entradas diferentes.
    Phase,
    /// Fases diferentes ou posição presente em só um dos runs.
    Mismatch,
}

/// Uma posição do alinhamento entre os runs A e B.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentEntry {
    /// Índice da posição (0-based).
    pub index: usize,

    /// Qualidade do casamento.
    pub kind: AlignmentKind,

    /// Step do run A nesta posição (`None` quando A acabou).
    pub a_step: Option<u64>,

    /// Step do run B nesta posição (`None` quando B acabou).
    pub b_step: Option<u64>,
}

/// Alinha dois runs por índice, até `max(|A|, |B|)`.
pub fn align(a: &LoadedRun, b: &LoadedRun) -> Vec<AlignmentEntry> {
    let len = a.steps.len().max(b.steps.len());
    let mut entries = Vec::with_capacity(len);

    for index in 0..len {
        let sa = a.steps.get(index);
        let sb = b.steps.get(index);

        let kind = match (sa, sb) {
            (Some(x), Some(y)) if x.phase == y.phase && x.input == y.input => {
                AlignmentKind::Exact
            }
            (Some(x), Some(y)) if x.phase == y.phase => AlignmentKind::Phase,
            _ => AlignmentKind::Mismatch,
        };

        entries.push(AlignmentEntry {
            index,
            kind,
            a_step: sa.map(|s| s.step_id),
            b_step: sb.map(|s| s.step_id),
        });
    }

    entries
}

/// Primeiro ponto de divergência entre dois runs.
///
/// Retorna o identificador do step do run A na primeira posição onde
/// input ou output diferem estruturalmente. Se os comprimentos diferem
/// mas todas as posições compartilhadas são idênticas, a divergência é
/// o último identificador compartilhado. `None` quando os runs são
/// idênticos (ou não há posição compartilhada).
pub fn divergence_point(a: &LoadedRun, b: &LoadedRun) -> Option<u64> {
    let shared = a.steps.len().min(b.steps.len());

    for i in 0..shared {
        let (sa, sb) = (&a.steps[i], &b.steps[i]);
        if sa.input != sb.input || sa.output != sb.output {
            return Some(sa.step_id);
        }
    }

    if a.steps.len() != b.steps.len() && shared > 0 {
        return Some(a.steps[shared - 1].step_id);
    }

    None
}

/// Relatório de comparação entre dois runs.
#[derive(Debug, Serialize)]
pub struct ComparisonReport {
    /// Run de referência (A).
    pub run_a: String,

    /// Run comparado (B).
    pub run_b: String,

    /// Alinhamento posição a posição.
    pub alignment: Vec<AlignmentEntry>,

    /// Ponto de divergência, se houver.
    pub divergence_point: Option<u64>,
}

/// Compara dois runs: alinhamento + ponto de divergência.
pub fn compare(a: &LoadedRun, b: &LoadedRun) -> ComparisonReport {
    ComparisonReport {
        run_a: a.meta.run_id.clone(),
        run_b: b.meta.run_id.clone(),
        alignment: align(a, b),
        divergence_point: divergence_point(a, b),
    }
}

// ============================================================================
// CLASSIFICADOR DE FERRAMENTAS
// ============================================================================

/// Classe heurística de uma ferramenta pelo nome.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolClass {
    /// Ferramenta exploratória (search, ls, read...).
    Exploratory,
    /// Ferramenta que comete mudanças (write, edit...).
    Committing,
    /// Nenhuma das duas.
    Neutral,
}

static EXPLORATORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(search|ls|read)").expect("regex exploratória compila"));

static COMMITTING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(write|edit)").expect("regex de commit compila"));

/// Classifica uma ferramenta pelo nome.
pub fn classify_tool(name: &str) -> ToolClass {
    if COMMITTING_RE.is_match(name) {
        ToolClass::Committing
    } else if EXPLORATORY_RE.is_match(name) {
        ToolClass::Exploratory
    } else {
        ToolClass::Neutral
    }
}

// ============================================================================
// CHECKS DE INVARIANTE (UM RUN)
// ============================================================================

/// Resultado de um check de invariante.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Nome estável do check.
    pub name: String,

    /// Passou?
    pub passed: bool,

    /// Detalhe legível (sempre presente, inclusive em pass).
    pub detail: String,
}

/// Um check é um predicado puro sobre o run carregado.
pub type InvariantCheck = fn(&LoadedRun) -> CheckResult;

/// Registro extensível de checks.
///
/// `default()` registra os checks obrigatórios; chamadores podem
/// registrar predicados adicionais antes de `run_all`.
pub struct CheckRegistry {
    checks: Vec<InvariantCheck>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self {
            checks: vec![check_retry_ceiling, check_tool_ordering, check_redaction],
        }
    }
}

impl CheckRegistry {
    /// Registra um check adicional.
    pub fn register(&mut self, check: InvariantCheck) {
        self.checks.push(check);
    }

    /// Executa todos os checks na ordem de registro.
    pub fn run_all(&self, run: &LoadedRun) -> Vec<CheckResult> {
        self.checks.iter().map(|check| check(run)).collect()
    }
}

/// Teto de retries: retries ≤ 50% do total de steps.
pub fn check_retry_ceiling(run: &LoadedRun) -> CheckResult {
    let total = run.steps.len();
    let retries = run
        .steps
        .iter()
        .filter(|s| s.phase == Phase::Retry)
        .count();

    let passed = retries * 2 <= total;
    CheckResult {
        name: "retry_ceiling".into(),
        passed,
        detail: format!("{} retries em {} steps", retries, total),
    }
}

/// Ordenação de ferramentas sob as restrições declaradas.
///
/// O classificador padrão rotula exploratórias e de commit, mas o
/// conjunto padrão de restrições é vazio: sem restrição declarada, o
/// check passa.
pub fn check_tool_ordering(run: &LoadedRun) -> CheckResult {
    let tools = run
        .steps
        .iter()
        .filter(|s| s.phase == Phase::Tool)
        .filter_map(|s| s.tool_name())
        .count();

    CheckResult {
        name: "tool_ordering".into(),
        passed: true,
        detail: format!(
            "nenhuma restrição declarada; {} invocações classificáveis",
            tools
        ),
    }
}

/// Varredura de redação: nenhum payload persistido contém segredo.
pub fn check_redaction(run: &LoadedRun) -> CheckResult {
    let redactor = default_redactor();
    let mut leaks = Vec::new();

    for step in &run.steps {
        let input = serde_json::Value::Object(step.input.clone());
        let output = serde_json::Value::Object(step.output.clone());
        for path in redactor.find_leaks(&input) {
            leaks.push(format!("step {} input.{}", step.step_id, path));
        }
        for path in redactor.find_leaks(&output) {
            leaks.push(format!("step {} output.{}", step.step_id, path));
        }
    }

    if leaks.is_empty() {
        CheckResult {
            name: "redaction".into(),
            passed: true,
            detail: "nenhum vazamento encontrado".into(),
        }
    } else {
        CheckResult {
            name: "redaction".into(),
            passed: false,
            detail: format!("vazamentos: {}", leaks.join(", ")),
        }
    }
}

// ============================================================================
// RÓTULOS SEMÂNTICOS
// ============================================================================

/// Rótulo heurístico de um step.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Label {
    /// Dois ou mais retries consecutivos.
    RetryLoop,
    /// Invocação de ferramenta exploratória.
    Exploration,
    /// Invocação de ferramenta que comete mudanças.
    Commitment,
}

/// Rótulos atribuídos a um step.
#[derive(Debug, Clone, Serialize)]
pub struct StepLabels {
    /// Step rotulado.
    pub step_id: u64,

    /// Rótulos na ordem de atribuição.
    pub labels: Vec<Label>,
}

/// Rotula os steps de um run. Não muta o artefato.
pub fn label_steps(run: &LoadedRun) -> Vec<StepLabels> {
    let mut labels: Vec<StepLabels> = run
        .steps
        .iter()
        .map(|s| StepLabels {
            step_id: s.step_id,
            labels: Vec::new(),
        })
        .collect();

    // retry-loop: janelas de dois ou mais status retry consecutivos.
    let mut i = 0;
    while i < run.steps.len() {
        if run.steps[i].status == StepStatus::Retry {
            let mut j = i;
            while j < run.steps.len() && run.steps[j].status == StepStatus::Retry {
                j += 1;
            }
            if j - i >= 2 {
                for entry in labels.iter_mut().take(j).skip(i) {
                    entry.labels.push(Label::RetryLoop);
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }

    // exploração/commit pelo classificador de nomes.
    for (idx, step) in run.steps.iter().enumerate() {
        if step.phase != Phase::Tool {
            continue;
        }
        if let Some(name) = step.tool_name() {
            match classify_tool(name) {
                ToolClass::Exploratory => labels[idx].labels.push(Label::Exploration),
                ToolClass::Committing => labels[idx].labels.push(Label::Commitment),
                ToolClass::Neutral => {}
            }
        }
    }

    labels.retain(|l| !l.labels.is_empty());
    labels
}

// ============================================================================
// CAUSA RAIZ
// ============================================================================

/// Causa raiz extraída de um run com falha.
#[derive(Debug, Clone, Serialize)]
pub struct RootCause {
    /// Primeiro step com status de erro.
    pub failure_step: u64,

    /// Até três steps imediatamente anteriores, em ordem.
    pub chain: Vec<u64>,

    /// Confiança heurística fixa.
    pub confidence: f64,

    /// Descrição legível da cadeia causal.
    pub description: String,
}

/// Confiança heurística atribuída a toda cadeia causal.
const ROOT_CAUSE_CONFIDENCE: f64 = 0.8;

/// Extrai a causa raiz: o primeiro step com erro e sua cadeia.
///
/// `None` quando o run não tem step com erro.
pub fn root_cause(run: &LoadedRun) -> Option<RootCause> {
    let (idx, failure) = run
        .steps
        .iter()
        .enumerate()
        .find(|(_, s)| s.status == StepStatus::Error)?;

    let start = idx.saturating_sub(3);
    let chain: Vec<u64> = run.steps[start..idx].iter().map(|s| s.step_id).collect();

    let description = if chain.is_empty() {
        format!(
            "step {} ({}) falhou sem predecessores registrados",
            failure.step_id,
            failure.phase.as_str()
        )
    } else {
        format!(
            "step {} ({}) falhou; cadeia imediata: {}",
            failure.step_id,
            failure.phase.as_str(),
            chain
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        )
    };

    Some(RootCause {
        failure_step: failure.step_id,
        chain,
        confidence: ROOT_CAUSE_CONFIDENCE,
        description,
    })
}

// ============================================================================
// RELATÓRIO AGREGADO
// ============================================================================

/// Relatório de análise de um único run.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    /// Run analisado.
    pub run_id: String,

    /// O run estava parcial ao carregar.
    pub partial: bool,

    /// Resultados dos checks de invariante.
    pub checks: Vec<CheckResult>,

    /// Rótulos semânticos por step (só steps rotulados).
    pub labels: Vec<StepLabels>,

    /// Causa raiz, quando há step com erro.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<RootCause>,
}

impl AnalysisReport {
    /// Todos os checks passaram?
    pub fn all_checks_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Analisa um run com o registro de checks padrão.
pub fn analyze(run: &LoadedRun) -> AnalysisReport {
    analyze_with(run, &CheckRegistry::default())
}

/// Analisa um run com um registro de checks customizado.
pub fn analyze_with(run: &LoadedRun, registry: &CheckRegistry) -> AnalysisReport {
    AnalysisReport {
        run_id: run.meta.run_id.clone(),
        partial: run.partial,
        checks: registry.run_all(run),
        labels: label_steps(run),
        root_cause: root_cause(run),
    }
}

// ============================================================================
// TESTES
// ============================================================================
