//! # Tracer - Substrato de Trace para Agentes Autônomos
//!
//! Grava, persiste e reexecuta deterministicamente execuções de agentes
//! de IA, para que o comportamento deles possa ser auditado, comparado
//! e testado em regressão como software comum.
//!
//! ## Arquitetura do núcleo
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        store/ (artefatos)                        │
//! │  meta.json + steps.jsonl + snapshots/ + diffs/ + tools/          │
//! └─────────────────────────────────────────────────────────────────┘
//!          ▲                      ▲                      ▲
//!          │                      │                      │
//!    ┌──────────┐          ┌──────────┐           ┌──────────┐
//!    │ recorder/│          │ replay/  │           │ analysis/│
//!    │ (grava)  │─────────▶│ (reexec.)│           │ (perícia)│
//!    └──────────┘          └──────────┘           └──────────┘
//! ```
//!
//! O recorder é o único escritor de um run; replay e análise são
//! leitores (o replay produz um run NOVO através de um recorder
//! secundário; contrafactuais idem). Colaboradores externos (UI de
//! edição, agentes demo) consomem esta biblioteca pela superfície de
//! instrumentação e pela leitura do store.

// ============================================================================
// DECLARAÇÃO DE MÓDULOS
// ============================================================================

/// Módulo de análise: alinhamento, checks de invariante, causa raiz,
/// contrafactuais.
pub mod analysis;

/// Módulo de assertions: checks declarativos do subcomando `test`.
pub mod assertions;

/// Módulo de diff: deltas estruturais entre snapshots.
pub mod diff;

/// Módulo de erros: códigos estruturados (E1xxx, E2xxx, ...) e o erro
/// de domínio `TraceError`.
pub mod errors;

/// Módulo de limites: teto de steps e de bytes de I/O capturados.
pub mod limits;

/// Módulo de protocolo: estruturas de dados do artefato em disco.
pub mod protocol;

/// Módulo do recorder: ciclo de vida, escopos de step, wrappers.
pub mod recorder;

/// Módulo de redação: mascaramento de segredos antes da persistência.
pub mod redaction;

/// Módulo do replay: endpoints substitutos, cursor e divergências.
pub mod replay;

/// Módulo de retry: política de novas tentativas do wrapper.
pub mod retry;

/// Módulo do store: persistência autoritativa e leitura tolerante.
pub mod store;

/// Módulo de telemetria: integração tracing + OpenTelemetry.
pub mod telemetry;

/// Módulo de validação: schemas de wire e invariantes estruturais.
pub mod validation;
