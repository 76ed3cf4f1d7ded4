//! # Construção de Contrafactuais
//!
//! Um contrafactual responde "e se o step N tivesse sido diferente?"
//! construindo um run NOVO que ramifica no pivô - o run de origem
//! nunca é tocado.
//!
//! ## Regras da ramificação:
//!
//! - steps estritamente anteriores ao pivô entram verbatim (campos
//!   desconhecidos inclusive)
//! - o pivô entra com a modificação aplicada e `status=retry`, pronto
//!   para re-execução
//! - snapshots e diffs dos steps mantidos NÃO são duplicados: os
//!   `state_ref` apontam para os caminhos originais e os leitores já
//!   toleram sidecars ausentes
//! - os metadados do novo run carregam as tags `simulation` e
//!   `source:<run_id>` e ficam com `status=running` (é um ramo
//!   pendente, não uma execução terminada)

use serde_json::Map;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::errors::{TraceError, TraceResult};
use crate::protocol::{RunMeta, RunStatus, StepStatus};
use crate::store::{ArtifactStore, LoadedRun};

/// Modificação aplicada ao step pivô.
///
/// Pelo menos um dos lados deve estar presente; o lado ausente mantém
/// o payload gravado.
#[derive(Debug, Clone, Default)]
pub struct PivotModification {
    /// Novo payload de entrada, se fornecido.
    pub input: Option<Map<String, serde_json::Value>>,

    /// Novo payload de saída, se fornecido.
    pub output: Option<Map<String, serde_json::Value>>,
}

impl PivotModification {
    /// Modificação que substitui o payload de entrada.
    pub fn with_input(input: Map<String, serde_json::Value>) -> Self {
        Self {
            input: Some(input),
            output: None,
        }
    }

    /// Modificação que substitui o payload de saída.
    pub fn with_output(output: Map<String, serde_json::Value>) -> Self {
        Self {
            input: None,
            output: Some(output),
        }
    }
}

/// Resultado da construção de um contrafactual.
#[derive(Debug)]
pub struct Counterfactual {
    /// Identificador do run derivado.
    pub run_id: String,

    /// Diretório do run derivado.
    pub dir: PathBuf,

    /// Steps gravados no ramo (anteriores + pivô).
    pub steps_written: usize,
}

/// Constrói um contrafactual de `source` ramificando em `pivot_step`.
///
/// O novo run é criado em `dest_base/<novo run_id>`. O run de origem é
/// somente leitura durante toda a operação.
pub fn build(
    source: &LoadedRun,
    pivot_step: u64,
    modification: PivotModification,
    dest_base: &Path,
) -> TraceResult<Counterfactual> {
    let pivot_idx = source
        .steps
        .iter()
        .position(|s| s.step_id == pivot_step)
        .ok_or_else(|| TraceError::InvalidArtifact {
            path: source.dir.display().to_string(),
            detail: format!("step pivô {} não existe no run", pivot_step),
        })?;

    let run_id = Uuid::new_v4().to_string();
    let dir = dest_base.join(&run_id);

    let meta = RunMeta {
        run_id: run_id.clone(),
        agent_version: source.meta.agent_version.clone(),
        llm: source.meta.llm.clone(),
        temperature: source.meta.temperature,
        tools: source.meta.tools.clone(),
        seed: source.meta.seed,
        created_at: chrono::Utc::now().to_rfc3339(),
        status: RunStatus::Running,
        termination_reason: None,
        truncated: false,
        tags: vec![
            "simulation".to_string(),
            format!("source:{}", source.meta.run_id),
        ],
        steps_digest: None,
        extra: Map::new(),
    };

    let mut store = ArtifactStore::create(&dir, meta)?;

    // Steps estritamente anteriores ao pivô, verbatim.
    for step in &source.steps[..pivot_idx] {
        store.append_step(step)?;
    }

    // Pivô com a modificação aplicada e status retry.
    let mut pivot = source.steps[pivot_idx].clone();
    if let Some(input) = modification.input {
        pivot.input = input;
    }
    if let Some(output) = modification.output {
        pivot.output = output;
    }
    pivot.status = StepStatus::Retry;
    store.append_step(&pivot)?;

    info!(
        source = %source.meta.run_id,
        counterfactual = %run_id,
        pivot = pivot_step,
        "Counterfactual branch created"
    );

    Ok(Counterfactual {
        run_id,
        dir,
        steps_written: pivot_idx + 1,
    })
}

// ============================================================================
// TESTES
// ============================================================================
