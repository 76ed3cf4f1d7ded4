//! # Módulo de Política de Retry
//!
//! Define a política de novas tentativas usada pelo wrapper de
//! ferramentas, com backoff exponencial e jitter opcional.
//!
//! ## Para todos entenderem:
//!
//! Às vezes uma ferramenta falha por motivos temporários:
//! - Serviço estava ocupado
//! - Rede teve um soluço
//! - Recurso ainda não estava pronto
//!
//! A política diz quantas vezes tentar de novo e quanto esperar entre
//! tentativas. Diferente de um retry invisível, aqui **cada tentativa
//! falha vira um step de fase `retry` no trace** - o replay e a análise
//! enxergam o custo real da execução.
//!
//! ## Semântica de contagem:
//!
//! `max_retries = N` permite N novas tentativas além da primeira, ou
//! seja, até `N + 1` execuções da ferramenta. Com `max_retries = 2` e
//! três falhas seguidas, o trace contém:
//!
//! ```text
//! retry (tentativa 1), retry (tentativa 2), tool (status=error)
//! ```
//!
//! ## O que é Backoff Exponencial?
//!
//! É uma técnica onde esperamos cada vez mais entre tentativas.
//! Exemplo: backoff_ms=100, backoff_factor=2
//! - 1ª falha: espera 100ms
//! - 2ª falha: espera 200ms (100 × 2)
//! - 3ª falha: espera 400ms (200 × 2)
//!
//! O jitter multiplica a espera por um fator aleatório em [0.5, 1.0],
//! espalhando clientes que falharam juntos.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// POLÍTICA DE RETRY
// ============================================================================

/// Política de novas tentativas de uma ferramenta embrulhada.
///
/// O padrão é não tentar de novo (`max_retries = 0`): falhou, falhou.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Número de NOVAS tentativas além da primeira execução.
    pub max_retries: u32,

    /// Delay base em milissegundos após a primeira falha.
    #[serde(default)]
    pub backoff_ms: u64,

    /// Fator multiplicador do backoff a cada tentativa.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Aplica jitter aleatório em [0.5, 1.0] sobre a espera.
    #[serde(default)]
    pub jitter: bool,
}

/// Valor padrão para o fator de backoff.
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
            backoff_factor: default_backoff_factor(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Política com N novas tentativas e sem espera entre elas.
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Política com backoff exponencial configurado.
    pub fn with_backoff(max_retries: u32, backoff_ms: u64, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            backoff_factor,
            jitter: false,
        }
    }

    /// Total de execuções permitidas (primeira + retries).
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Espera calculada para a tentativa falha `attempt` (1-based).
    ///
    /// Exemplo: backoff_ms=100, factor=2.0 → 100ms, 200ms, 400ms...
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(30);
        let base = self.backoff_ms as f64 * self.backoff_factor.powi(exp as i32);
        let millis = if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            base * factor
        } else {
            base
        };
        Duration::from_millis(millis as u64)
    }

    /// Aguarda o backoff da tentativa falha `attempt`.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.backoff_for(attempt);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fail_fast() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.backoff_for(1), Duration::ZERO);
    }

    #[test]
    fn test_attempts_counts_first_execution() {
        assert_eq!(RetryPolicy::retries(2).attempts(), 3);
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy::with_backoff(3, 100, 2.0);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_half_and_full() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_ms: 1000,
            backoff_factor: 2.0,
            jitter: true,
        };
        for _ in 0..50 {
            let d = policy.backoff_for(1);
            assert!(d >= Duration::from_millis(500), "jitter abaixo do piso");
            assert!(d <= Duration::from_millis(1000), "jitter acima do teto");
        }
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff_factor, 2.0);
        assert!(!policy.jitter);
    }
}
