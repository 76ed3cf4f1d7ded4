//! # Módulo de Códigos de Erro Estruturados
//!
//! Define códigos de erro padronizados para melhor UX e integração
//! com sistemas externos (CI/CD, dashboards, alertas).
//!
//! ## Para todos entenderem:
//!
//! Quando algo dá errado, este módulo fornece códigos únicos
//! que identificam exatamente o que aconteceu.
//!
//! É como ter um "número do erro" que você pode pesquisar
//! na documentação ou passar para o suporte.
//!
//! ## Categorias de Erro
//!
//! Os códigos são organizados por categoria:
//!
//! | Faixa  | Categoria       | Descrição                          |
//! |--------|-----------------|------------------------------------|
//! | E1xxx  | Artefato        | Corrupção ou run selado            |
//! | E2xxx  | Ciclo de vida   | Uso incorreto do recorder          |
//! | E3xxx  | Replay          | Divergência dura durante replay    |
//! | E4xxx  | Configuração    | Problema de setup/ambiente         |
//! | E5xxx  | Interno         | Bug no próprio Tracer              |
//!
//! ## Exemplo:
//!
//! ```text
//! Error E2004: tentativa de abrir um step com outro step aberto
//!   Run: 7c0f...
//!   Step aberto: 12
//! ```
//!
//! Com o código E2004, você sabe que:
//! - É um erro de ciclo de vida (2xxx)
//! - Especificamente aninhamento de steps (004)

use std::fmt;
use thiserror::Error;

// ============================================================================
// CÓDIGO DE ERRO
// ============================================================================

/// Código de erro estruturado com categoria e número.
///
/// O código é um número de 4 dígitos onde:
/// - Primeiro dígito: categoria (1-5)
/// - Últimos 3 dígitos: erro específico (001-999)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // ========================================================================
    // E1xxx: Artefato
    // ========================================================================
    // Erros de leitura/escrita no artefato de trace.
    // O problema está nos arquivos do run, não no chamador.

    /// Artefato inválido (metadados ausentes ou malformados).
    pub const INVALID_ARTIFACT: Self = Self(1001);

    /// Escrita em um run já selado.
    pub const SEALED: Self = Self(1002);

    /// Sequência de step_id não contígua no log.
    pub const STEP_GAP: Self = Self(1003);

    /// Snapshot referenciado por um step não existe.
    pub const MISSING_SNAPSHOT: Self = Self(1004);

    /// Digest de steps.jsonl não bate com o gravado no seal.
    pub const DIGEST_MISMATCH: Self = Self(1005);

    // ========================================================================
    // E2xxx: Ciclo de Vida
    // ========================================================================
    // Uso incorreto da superfície de instrumentação.

    /// Instrumentação chamada sem run ativo.
    pub const NO_ACTIVE_RUN: Self = Self(2001);

    /// Segundo `init` sem `stop` no mesmo processo.
    pub const ALREADY_ACTIVE: Self = Self(2002);

    /// Limite de steps atingido, run truncado.
    pub const LIMIT_EXCEEDED: Self = Self(2003);

    /// Tentativa de abrir um step com outro aberto.
    pub const NESTED_STEP: Self = Self(2004);

    // ========================================================================
    // E3xxx: Replay
    // ========================================================================
    // Falhas duras do motor de replay. Divergências comuns são
    // acumuladas no relatório, nunca viram erro.

    /// Agente pediu mais chamadas do que foi gravado.
    pub const CURSOR_EXHAUSTED: Self = Self(3001);

    /// Ferramenta pedida não casa com a gravada na posição do cursor.
    pub const TOOL_MISMATCH: Self = Self(3002);

    /// Snapshot final difere do gravado.
    pub const STATE_MISMATCH: Self = Self(3003);

    // ========================================================================
    // E4xxx: Configuração/Ambiente
    // ========================================================================

    /// Arquivo de assertions não encontrado ou ilegível.
    pub const ASSERTION_FILE_NOT_FOUND: Self = Self(4001);

    /// Arquivo de assertions não passa no schema.
    pub const INVALID_ASSERTION_FILE: Self = Self(4002);

    // ========================================================================
    // E5xxx: Erros Internos
    // ========================================================================
    // Bugs no próprio Tracer. Se você ver esses, reporte!

    /// Erro de I/O do sistema de arquivos.
    pub const IO_ERROR: Self = Self(5001);

    /// Erro de serialização.
    pub const SERIALIZATION_ERROR: Self = Self(5002);

    // ========================================================================
    // MÉTODOS
    // ========================================================================

    /// Retorna o código numérico.
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Retorna o código formatado com prefixo "E".
    ///
    /// Exemplo: ErrorCode::SEALED.formatted() == "E1002"
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    /// Retorna a categoria do erro baseado no primeiro dígito.
    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Artifact,
            2 => ErrorCategory::Lifecycle,
            3 => ErrorCategory::Replay,
            4 => ErrorCategory::Configuration,
            5 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

// ============================================================================
// CATEGORIA DE ERRO
// ============================================================================

/// Categoria de erro baseada no primeiro dígito do código.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Erros de artefato (E1xxx).
    Artifact,
    /// Erros de ciclo de vida do recorder (E2xxx).
    Lifecycle,
    /// Erros duros de replay (E3xxx).
    Replay,
    /// Erros de configuração/ambiente (E4xxx).
    Configuration,
    /// Erros internos (E5xxx).
    Internal,
    /// Código fora das faixas conhecidas.
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact => write!(f, "Artefato"),
            Self::Lifecycle => write!(f, "Ciclo de vida"),
            Self::Replay => write!(f, "Replay"),
            Self::Configuration => write!(f, "Configuração"),
            Self::Internal => write!(f, "Interno"),
            Self::Unknown => write!(f, "Desconhecido"),
        }
    }
}

// ============================================================================
// ERRO DE DOMÍNIO: TRACE ERROR
// ============================================================================

/// Erro de domínio do substrato de trace.
///
/// Cada variante corresponde a uma condição nomeada da superfície de
/// erro do sistema. O atributo `#[error(...)]` define a mensagem que
/// será exibida; `code()` mapeia para o [`ErrorCode`] estruturado.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Artefato corrompido ou ilegível no nível do store.
    #[error("artefato inválido em '{path}': {detail}")]
    InvalidArtifact { path: String, detail: String },

    /// Escrita em um run que já foi selado.
    #[error("run '{run_id}' já está selado; escrita rejeitada")]
    Sealed { run_id: String },

    /// Instrumentação chamada sem run em gravação.
    #[error("nenhum run ativo; chame init antes de instrumentar")]
    NoActiveRun,

    /// Segundo `init` sem `stop` no mesmo processo.
    #[error("já existe um run em gravação neste processo")]
    AlreadyActive,

    /// Tentativa de abrir um step com outro ainda aberto.
    #[error("step {open_step} ainda aberto; steps aninhados são proibidos")]
    NestedStep { open_step: u64 },

    /// Limite de steps atingido; run selado com truncated=true.
    #[error("limite de {max_steps} steps atingido; run truncado")]
    LimitExceeded { max_steps: u64 },

    /// Agente sob replay pediu mais chamadas do que foi gravado.
    #[error("cursor de replay esgotado após o step {last_step}")]
    CursorExhausted { last_step: u64 },

    /// Ferramenta pedida difere da gravada na posição do cursor.
    #[error("replay esperava a ferramenta '{recorded}' mas o agente pediu '{requested}'")]
    ToolMismatch { recorded: String, requested: String },

    /// Campo do snapshot final difere entre original e replay.
    #[error("snapshot final diverge no campo '{field}'")]
    StateMismatch { field: String },

    /// Erro de I/O do sistema de arquivos subjacente.
    #[error("erro de I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Erro de (de)serialização JSON.
    #[error("erro de serialização: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TraceError {
    /// Código estruturado correspondente à variante.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArtifact { .. } => ErrorCode::INVALID_ARTIFACT,
            Self::Sealed { .. } => ErrorCode::SEALED,
            Self::NoActiveRun => ErrorCode::NO_ACTIVE_RUN,
            Self::AlreadyActive => ErrorCode::ALREADY_ACTIVE,
            Self::NestedStep { .. } => ErrorCode::NESTED_STEP,
            Self::LimitExceeded { .. } => ErrorCode::LIMIT_EXCEEDED,
            Self::CursorExhausted { .. } => ErrorCode::CURSOR_EXHAUSTED,
            Self::ToolMismatch { .. } => ErrorCode::TOOL_MISMATCH,
            Self::StateMismatch { .. } => ErrorCode::STATE_MISMATCH,
            Self::Io(_) => ErrorCode::IO_ERROR,
            Self::Serialization(_) => ErrorCode::SERIALIZATION_ERROR,
        }
    }
}

/// Alias de resultado usado em todo o núcleo.
pub type TraceResult<T> = Result<T, TraceError>;

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::INVALID_ARTIFACT.formatted(), "E1001");
        assert_eq!(ErrorCode::NESTED_STEP.formatted(), "E2004");
        assert_eq!(ErrorCode::CURSOR_EXHAUSTED.formatted(), "E3001");
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::SEALED.category(), ErrorCategory::Artifact);
        assert_eq!(
            ErrorCode::NO_ACTIVE_RUN.category(),
            ErrorCategory::Lifecycle
        );
        assert_eq!(ErrorCode::TOOL_MISMATCH.category(), ErrorCategory::Replay);
        assert_eq!(
            ErrorCode::INVALID_ASSERTION_FILE.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ErrorCode::IO_ERROR.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_trace_error_maps_to_code() {
        let err = TraceError::NestedStep { open_step: 12 };
        assert_eq!(err.code(), ErrorCode::NESTED_STEP);
        assert!(err.to_string().contains("12"));

        let err = TraceError::Sealed {
            run_id: "abc".into(),
        };
        assert_eq!(err.code(), ErrorCode::SEALED);
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: TraceError = io.into();
        assert_eq!(err.code(), ErrorCode::IO_ERROR);
    }
}
