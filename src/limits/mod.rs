//! # Módulo de Limites de Gravação
//!
//! Define políticas de limite para proteger o substrato contra agentes
//! que entram em loop ou produzem quantidades patológicas de saída.
//!
//! ## Para todos entenderem:
//!
//! Imagine uma câmera de segurança com cartão de memória finito:
//! - Máximo de N cenas gravadas (evita encher o disco)
//! - Máximo de bytes por cena (evita uma cena gigante)
//!
//! Este módulo faz exatamente isso para a gravação de traces. Quando o
//! limite de steps é atingido, o recorder escreve um step final de
//! `terminate` e sela o run com `truncated=true` - o artefato continua
//! válido e analisável, apenas incompleto.
//!
//! ## Limites configuráveis:
//!
//! | Limite        | Padrão  | Descrição                               |
//! |---------------|---------|-----------------------------------------|
//! | max_steps     | 1000    | Máximo de steps por run                 |
//! | max_io_bytes  | 4 MiB   | Máximo de bytes capturados por stream   |

use serde::{Deserialize, Serialize};

// ============================================================================
// LIMITES PADRÃO (CONSTANTES)
// ============================================================================

/// Número máximo de steps persistidos em um run.
/// Ao atingir, o run é selado com `termination_reason=limit_exceeded`.
pub const DEFAULT_MAX_STEPS: u64 = 1000;

/// Bytes máximos capturados por stream (stdout/stderr) por step.
/// Excedentes são descartados e contados no aviso do recorder.
pub const DEFAULT_MAX_IO_BYTES: u64 = 4 * 1024 * 1024;

// ============================================================================
// ESTRUTURA DE LIMITES
// ============================================================================

/// Configuração de limites do recorder.
///
/// Pode ser carregada de variáveis de ambiente ou construída direto.
/// Todos os campos têm valores padrão seguros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderLimits {
    /// Número máximo de steps no run.
    /// O último slot é reservado para o step de `terminate`.
    pub max_steps: u64,

    /// Bytes máximos por stream de I/O capturado por step.
    pub max_io_bytes: u64,
}

impl Default for RecorderLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_io_bytes: DEFAULT_MAX_IO_BYTES,
        }
    }
}

impl RecorderLimits {
    /// Cria limites a partir de variáveis de ambiente.
    ///
    /// Variáveis suportadas:
    /// - `TRACER_MAX_STEPS`: máximo de steps
    /// - `TRACER_MAX_IO_BYTES`: máximo de bytes por stream
    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Ok(val) = std::env::var("TRACER_MAX_STEPS") {
            if let Ok(n) = val.parse() {
                limits.max_steps = n;
            }
        }

        if let Ok(val) = std::env::var("TRACER_MAX_IO_BYTES") {
            if let Ok(n) = val.parse() {
                limits.max_io_bytes = n;
            }
        }

        limits
    }

    /// Limites restritivos para testes.
    pub fn strict() -> Self {
        Self {
            max_steps: 10,
            max_io_bytes: 64 * 1024,
        }
    }

    /// Limites permissivos para sessões longas de desenvolvimento.
    pub fn relaxed() -> Self {
        Self {
            max_steps: 10_000,
            max_io_bytes: 64 * 1024 * 1024,
        }
    }

    /// Constrói limites com um teto de steps específico.
    pub fn with_max_steps(max_steps: u64) -> Self {
        Self {
            max_steps,
            ..Self::default()
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
    fn test_default_limits() {
        let limits = RecorderLimits::default();
        assert_eq!(limits.max_steps, 1000);
        assert_eq!(limits.max_io_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_strict_limits() {
        let limits = RecorderLimits::strict();
        assert_eq!(limits.max_steps, 10);
        assert_eq!(limits.max_io_bytes, 64 * 1024);
    }

    #[test]
    fn test_with_max_steps() {
        let limits = RecorderLimits::with_max_steps(3);
        assert_eq!(limits.max_steps, 3);
        assert_eq!(limits.max_io_bytes, DEFAULT_MAX_IO_BYTES);
    }
}
