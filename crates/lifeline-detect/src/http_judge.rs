//! Judge backed by an Ollama-compatible `/api/generate` endpoint.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use lifeline_core::{ClassifierError, ContextJudge, JudgeVerdict, Message, RiskLevel, SenderRole};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct HttpJudge {
    client: Client,
    endpoint: String,
    model: String,
    request_timeout: Duration,
}

impl HttpJudge {
    /// `request_timeout` bounds the whole HTTP exchange; the adapter applies
    /// its own timeout on top.
    pub fn new(base_url: &str, model: &str, request_timeout: Duration) -> Result<Self, ClassifierError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ContextJudge for HttpJudge {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn classify(&self, text: &str, context: &[Message]) -> Result<JudgeVerdict, ClassifierError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(text, context),
            stream: false,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(self.request_timeout)
                } else {
                    ClassifierError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClassifierError::from_status(status.as_u16(), body));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;
        parse_verdict(&parsed.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

fn speaker(role: SenderRole) -> &'static str {
    match role {
        SenderRole::User => "Usuário",
        SenderRole::Automated => "Assistente",
        SenderRole::Monitor => "Monitor",
    }
}

/// Portuguese instruction prompt asking for a single `NIVEL:NUMERO` line.
pub fn build_prompt(text: &str, context: &[Message]) -> String {
    let mut prompt = String::from(
        "Você é um profissional de saúde mental treinado para avaliar mensagens de chat em português.\n\n\
         Sua tarefa: Classificar o nível de risco emocional desta mensagem.\n\n",
    );
    if !context.is_empty() {
        prompt.push_str("Mensagens anteriores:\n");
        for m in context {
            let _ = writeln!(prompt, "{}: {}", speaker(m.sender), m.text);
        }
        prompt.push('\n');
    }
    let _ = write!(
        prompt,
        "Texto: \"{text}\"\n\n\
         Instruções:\n\
         - Analise o conteúdo emocional e psicológico\n\
         - Identifique sinais de angústia, tristeza ou crise\n\
         - Responda APENAS no formato: NIVEL:NUMERO\n\
         - Não adicione explicações ou comentários\n\n\
         Níveis disponíveis:\nNONE:0.1\nLOW:0.3\nMEDIUM:0.6\nHIGH:0.8\nCRITICAL:0.9\n\n\
         EXEMPLO DE RESPOSTA: 'LOW:0.3'\n\nSua análise:"
    );
    prompt
}

/// Parse `LEVEL:CONFIDENCE` from the first line that has one. Confidence is clamped to [0, 1].
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict, ClassifierError> {
    let malformed = || ClassifierError::Malformed(raw.chars().take(80).collect());

    let line = raw
        .lines()
        .map(|l| l.trim().trim_matches(|c| c == '\'' || c == '"' || c == '`'))
        .find(|l| l.contains(':'))
        .ok_or_else(malformed)?;

    let (level, confidence) = line.split_once(':').ok_or_else(malformed)?;
    let tier: RiskLevel = level.trim().parse().map_err(|_| malformed())?;
    let confidence: f64 = confidence
        .trim()
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .filter(|c: &f64| c.is_finite())
        .ok_or_else(malformed)?;

    Ok(JudgeVerdict {
        tier,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lifeline_core::{ConversationId, RiskAssessment};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_plain_verdict() {
        let v = parse_verdict("HIGH:0.8").unwrap();
        assert_eq!(v.tier, RiskLevel::High);
        assert_eq!(v.confidence, 0.8);
    }

    #[test]
    fn parses_quoted_and_noisy_verdict() {
        let v = parse_verdict("  'critical: 0.95' \n").unwrap();
        assert_eq!(v.tier, RiskLevel::Critical);
        let v = parse_verdict("Sua análise\nLOW:0.3 (tristeza leve)").unwrap();
        assert_eq!(v.tier, RiskLevel::Low);
        assert_eq!(v.confidence, 0.3);
    }

    #[test]
    fn clamps_confidence() {
        assert_eq!(parse_verdict("MEDIUM:7").unwrap().confidence, 1.0);
        assert_eq!(parse_verdict("MEDIUM:-1").unwrap().confidence, 0.0);
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "acho que está tudo bem", "SEVERE:0.5", "HIGH:muito", "HIGH:NaN"] {
            assert!(
                matches!(parse_verdict(raw), Err(ClassifierError::Malformed(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn prompt_includes_context() {
        let ctx = vec![Message::new(
            ConversationId::from_raw("conv_1"),
            SenderRole::User,
            "estou cansado",
            Utc::now(),
            RiskAssessment::unassessed(),
            false,
        )];
        let p = build_prompt("não aguento mais", &ctx);
        assert!(p.contains("Usuário: estou cansado"));
        assert!(p.contains("Texto: \"não aguento mais\""));
        assert!(p.contains("NIVEL:NUMERO"));
    }

    #[tokio::test]
    async fn classify_against_ollama_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({"model": "llama3.2:3b", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "llama3.2:3b",
                "response": "HIGH:0.8",
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let judge = HttpJudge::new(&server.uri(), "llama3.2:3b", Duration::from_secs(2)).unwrap();
        let v = judge.classify("não aguento mais", &[]).await.unwrap();
        assert_eq!(v.tier, RiskLevel::High);
        assert_eq!(v.confidence, 0.8);
    }

    #[tokio::test]
    async fn server_error_maps_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .mount(&server)
            .await;

        let judge = HttpJudge::new(&format!("{}/", server.uri()), "m", Duration::from_secs(2)).unwrap();
        let err = judge.classify("x", &[]).await.unwrap_err();
        assert_eq!(err, ClassifierError::from_status(503, "loading model".into()));
    }

    #[tokio::test]
    async fn unparseable_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"response": "não sei"})))
            .mount(&server)
            .await;

        let judge = HttpJudge::new(&server.uri(), "m", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            judge.classify("x", &[]).await,
            Err(ClassifierError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn connection_refused_is_transport() {
        let judge = HttpJudge::new("http://127.0.0.1:1", "m", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            judge.classify("x", &[]).await,
            Err(ClassifierError::Transport(_))
        ));
    }
}
