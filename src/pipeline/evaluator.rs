//! State evaluator: decides what to do with a message.
//!
//! Pure: the decision depends only on the conversation context, the text
//! and the supplied clock. Rules are checked in priority order and the
//! first match wins:
//!
//! 1. proxy active (only MENU escapes it)
//! 2. sticky pin to a non-default area
//! 3. reserved commands (MENU / VOLVER / ATRAS)
//! 4. anti-loop courtesy after a recent handoff
//! 5. numeric root-menu selection
//! 6. default-area fallback

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;
use crate::pipeline::area::menu_option;
use crate::pipeline::types::{ActionKind, ConversationContext, Decision, ReasonCode};

/// Commands that show the root menu.
const MENU_COMMANDS: &[&str] = &["MENU", "MENÚ"];

/// Commands that go back to the root menu.
const BACK_COMMANDS: &[&str] = &["VOLVER", "ATRAS", "ATRÁS"];

/// Acknowledgement vocabulary (matched as lowercase substrings).
const COURTESY_TOKENS: &[&str] = &[
    "ok", "okay", "gracias", "perfecto", "genial", "listo", "dale", "bueno", "👍", "✅", "👌",
    "🙏",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Courtesy replies are sent instead of re-routing within this many
    /// minutes of a handoff.
    pub antiloop_window_minutes: i64,
    /// Messaging window opened on first contact.
    pub messaging_window_hours: i64,
    /// Extended window for paid leads.
    pub lead_window_hours: i64,
    /// A handoff timestamp further in the future than this is a clock error.
    pub clock_skew_tolerance_secs: i64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            antiloop_window_minutes: 30,
            messaging_window_hours: 24,
            lead_window_hours: 72,
            clock_skew_tolerance_secs: 300,
        }
    }
}

impl EvaluatorConfig {
    pub fn antiloop_window(&self) -> Duration {
        Duration::minutes(self.antiloop_window_minutes)
    }

    pub fn messaging_window(&self) -> Duration {
        Duration::hours(self.messaging_window_hours)
    }

    pub fn lead_window(&self) -> Duration {
        Duration::hours(self.lead_window_hours)
    }
}

fn is_menu_command(normalized: &str) -> bool {
    MENU_COMMANDS.contains(&normalized)
}

fn is_back_command(normalized: &str) -> bool {
    BACK_COMMANDS.contains(&normalized)
}

/// Substring match, so "ok!" and "muchas gracias" both count.
fn is_courtesy(text: &str) -> bool {
    let lower = text.to_lowercase();
    COURTESY_TOKENS.iter().any(|token| lower.contains(token))
}

#[derive(Debug, Clone, Default)]
pub struct StateEvaluator {
    config: EvaluatorConfig,
}

impl StateEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Decide what to do with `text`. Never fails: evaluation errors become
    /// an `error` decision with reason `system_error`.
    pub fn evaluate(&self, ctx: &ConversationContext, text: &str, now: DateTime<Utc>) -> Decision {
        let antiloop_active = self.antiloop_active(ctx, now);
        let timeout_active = self.timeout_active(ctx, now);

        let mut decision = match self.try_evaluate(ctx, text, now, antiloop_active) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(contact = %ctx.contact, error_kind = e.kind(), "Evaluation failed: {e}");
                let mut decision = Decision::new(ActionKind::Error, ReasonCode::SystemError);
                decision.metadata = serde_json::json!({ "error": e.to_string() });
                decision
            }
        };

        decision.antiloop_active = antiloop_active;
        decision.timeout_active = timeout_active;
        if let Some(meta) = decision.metadata.as_object_mut() {
            meta.insert("antiloop_active".into(), antiloop_active.into());
            meta.insert("timeout_active".into(), timeout_active.into());
        }
        decision
    }

    fn try_evaluate(
        &self,
        ctx: &ConversationContext,
        text: &str,
        now: DateTime<Utc>,
        antiloop_active: bool,
    ) -> Result<Decision, PipelineError> {
        if let Some(at) = ctx.last_handoff_at {
            if at - now > Duration::seconds(self.config.clock_skew_tolerance_secs) {
                return Err(PipelineError::SystemError(format!(
                    "last handoff {at} is in the future"
                )));
            }
        }

        let trimmed = text.trim();
        let command = trimmed.to_uppercase();

        // 1. Proxy: everything goes to the human queue unless they ask for the menu.
        if ctx.proxy_active {
            if is_menu_command(&command) {
                let mut decision = Decision::new(ActionKind::ShowMenu, ReasonCode::ProxyMenuCommand);
                decision.deactivate_proxy = true;
                return Ok(decision);
            }
            let mut decision =
                Decision::new(ActionKind::ContinueHuman, ReasonCode::ProxyAutoRedirect);
            decision.target = ctx.proxy_target;
            return Ok(decision);
        }

        // 2. Sticky pin
        if ctx.disconnected_from_default && !ctx.area.is_default() {
            return Ok(Decision::new(ActionKind::HandOff, ReasonCode::PinnedConversation)
                .with_target(ctx.area, ctx.sub_label.as_deref()));
        }

        // 3. Reserved commands
        if is_menu_command(&command) || is_back_command(&command) {
            return Ok(Decision::new(ActionKind::ShowMenu, ReasonCode::MenuCommand));
        }

        // 4. Anti-loop
        if antiloop_active && is_courtesy(trimmed) {
            return Ok(Decision::new(ActionKind::Courtesy, ReasonCode::AntiloopCourtesy)
                .with_target(ctx.area, ctx.sub_label.as_deref()));
        }

        // 5. Menu selection
        if let Some(option) = trimmed.parse::<u8>().ok().and_then(menu_option) {
            if ctx.area == option.area {
                let mut decision = Decision::new(ActionKind::ContinueHuman, ReasonCode::AlreadyInArea)
                    .with_target(option.area, Some(option.sub_label));
                decision.selected_option = Some(option.number);
                return Ok(decision);
            }
            let mut decision = Decision::new(ActionKind::HandOff, ReasonCode::MenuSelection)
                .with_target(option.area, Some(option.sub_label));
            decision.selected_option = Some(option.number);
            return Ok(decision);
        }

        // 6. Fallback
        if ctx.area.is_default() {
            Ok(Decision::new(ActionKind::ShowMenu, ReasonCode::DefaultArea))
        } else {
            let mut decision =
                Decision::new(ActionKind::ContinueHuman, ReasonCode::HumanConversation);
            decision.target = Some(ctx.area);
            Ok(decision)
        }
    }

    /// Strictly inside the anti-loop window since the last handoff.
    fn antiloop_active(&self, ctx: &ConversationContext, now: DateTime<Utc>) -> bool {
        ctx.last_handoff_at
            .is_some_and(|at| now - at < self.config.antiloop_window())
    }

    /// The messaging window (lead window for paid leads) has run out.
    fn timeout_active(&self, ctx: &ConversationContext, now: DateTime<Utc>) -> bool {
        let expires_at = match (ctx.is_lead, ctx.lead_expires_at) {
            (true, Some(lead)) => lead.max(ctx.window_expires_at),
            _ => ctx.window_expires_at,
        };
        now >= expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::area::Area;

    fn evaluator() -> StateEvaluator {
        StateEvaluator::default()
    }

    fn ctx(now: DateTime<Utc>) -> ConversationContext {
        ConversationContext::new("+5491111111111", now, Duration::hours(24))
    }

    #[test]
    fn menu_shows_root_menu() {
        let now = Utc::now();
        for text in ["MENU", "menu", " Menú ", "volver", "ATRÁS", "atras"] {
            let d = evaluator().evaluate(&ctx(now), text, now);
            assert_eq!(d.action, ActionKind::ShowMenu, "text {text:?}");
            assert_eq!(d.reason, ReasonCode::MenuCommand);
            assert!(d.target.is_none());
        }
    }

    #[test]
    fn option_one_hands_off_to_admin() {
        let now = Utc::now();
        let d = evaluator().evaluate(&ctx(now), "1", now);
        assert_eq!(d.action, ActionKind::HandOff);
        assert_eq!(d.target, Some(Area::Admin));
        assert_eq!(d.sub_label.as_deref(), Some("administracion"));
        assert_eq!(d.selected_option, Some(1));
        assert_eq!(d.reason, ReasonCode::MenuSelection);
        assert!(d.requires_handoff);
    }

    #[test]
    fn option_for_current_area_continues_human() {
        let now = Utc::now();
        let mut c = ctx(now);
        c.area = Area::Ventas;
        let d = evaluator().evaluate(&c, " 3 ", now);
        assert_eq!(d.action, ActionKind::ContinueHuman);
        assert_eq!(d.reason, ReasonCode::AlreadyInArea);
        assert!(!d.is_automatic);
    }

    #[test]
    fn out_of_range_option_falls_through() {
        let now = Utc::now();
        for text in ["0", "5", "300", "-1"] {
            let d = evaluator().evaluate(&ctx(now), text, now);
            assert_eq!(d.action, ActionKind::ShowMenu);
            assert_eq!(d.reason, ReasonCode::DefaultArea);
        }
    }

    #[test]
    fn sticky_pin_wins_over_commands() {
        let now = Utc::now();
        let mut c = ctx(now);
        c.area = Area::Ventas;
        c.sub_label = Some("inscripciones".into());
        c.disconnected_from_default = true;
        for text in ["MENU", "1", "hola"] {
            let d = evaluator().evaluate(&c, text, now);
            assert_eq!(d.action, ActionKind::HandOff);
            assert_eq!(d.target, Some(Area::Ventas));
            assert_eq!(d.reason, ReasonCode::PinnedConversation);
        }
    }

    #[test]
    fn pin_on_default_area_is_ignored() {
        let now = Utc::now();
        let mut c = ctx(now);
        c.disconnected_from_default = true;
        let d = evaluator().evaluate(&c, "hola", now);
        assert_eq!(d.reason, ReasonCode::DefaultArea);
    }

    #[test]
    fn proxy_redirects_everything_but_menu() {
        let now = Utc::now();
        let mut c = ctx(now);
        c.proxy_active = true;
        c.proxy_target = Some(Area::Alumnos);
        c.area = Area::Alumnos;
        c.disconnected_from_default = true;
        c.last_handoff_at = Some(now - Duration::minutes(1));

        for text in ["cualquier texto", "1", "VOLVER", "gracias"] {
            let d = evaluator().evaluate(&c, text, now);
            assert_eq!(d.action, ActionKind::ContinueHuman, "text {text:?}");
            assert_eq!(d.reason, ReasonCode::ProxyAutoRedirect);
            assert_eq!(d.target, Some(Area::Alumnos));
            assert!(!d.is_automatic);
        }

        let d = evaluator().evaluate(&c, "menú", now);
        assert_eq!(d.action, ActionKind::ShowMenu);
        assert_eq!(d.reason, ReasonCode::ProxyMenuCommand);
        assert!(d.deactivate_proxy);
    }

    #[test]
    fn antiloop_boundary() {
        let now = Utc::now();
        let window = EvaluatorConfig::default().antiloop_window();
        let eps = Duration::seconds(1);
        let mut c = ctx(now);
        c.area = Area::Admin;

        c.last_handoff_at = Some(now - (window - eps));
        let inside = evaluator().evaluate(&c, "Gracias!", now);
        assert_eq!(inside.action, ActionKind::Courtesy);
        assert_eq!(inside.reason, ReasonCode::AntiloopCourtesy);
        assert_eq!(inside.target, Some(Area::Admin));
        assert!(inside.antiloop_active);

        c.last_handoff_at = Some(now - window);
        let exact = evaluator().evaluate(&c, "Gracias!", now);
        assert_ne!(exact.action, ActionKind::Courtesy);
        assert!(!exact.antiloop_active);

        c.last_handoff_at = Some(now - (window + eps));
        let outside = evaluator().evaluate(&c, "Gracias!", now);
        assert_eq!(outside.action, ActionKind::ContinueHuman);
        assert_eq!(outside.reason, ReasonCode::HumanConversation);
    }

    #[test]
    fn courtesy_matches_substrings_and_emoji() {
        assert!(is_courtesy("muchas GRACIAS"));
        assert!(is_courtesy("👍"));
        assert!(is_courtesy("ok!"));
        assert!(!is_courtesy("quiero inscribirme"));
    }

    #[test]
    fn non_courtesy_after_handoff_falls_through() {
        let now = Utc::now();
        let mut c = ctx(now);
        c.area = Area::Admin;
        c.last_handoff_at = Some(now - Duration::minutes(2));
        let d = evaluator().evaluate(&c, "necesito un certificado", now);
        assert_eq!(d.action, ActionKind::ContinueHuman);
        assert!(d.antiloop_active);
    }

    #[test]
    fn default_fallbacks() {
        let now = Utc::now();
        let d = evaluator().evaluate(&ctx(now), "hola", now);
        assert_eq!(d.action, ActionKind::ShowMenu);
        assert_eq!(d.reason, ReasonCode::DefaultArea);

        let mut c = ctx(now);
        c.area = Area::Comunidad;
        let d = evaluator().evaluate(&c, "hola", now);
        assert_eq!(d.action, ActionKind::ContinueHuman);
        assert_eq!(d.reason, ReasonCode::HumanConversation);
    }

    #[test]
    fn evaluation_is_pure() {
        let now = Utc::now();
        let mut c = ctx(now);
        c.last_handoff_at = Some(now - Duration::minutes(5));
        c.area = Area::Admin;
        for text in ["MENU", "1", "ok", "hola", ""] {
            let a = evaluator().evaluate(&c, text, now);
            let b = evaluator().evaluate(&c, text, now);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn flags_attached_to_every_decision() {
        let now = Utc::now();
        let c = ConversationContext::new("+5491111111111", now - Duration::hours(30), Duration::hours(24));
        let d = evaluator().evaluate(&c, "MENU", now);
        assert!(d.timeout_active);
        assert_eq!(d.metadata["timeout_active"], true);
        assert_eq!(d.metadata["antiloop_active"], false);
        // The flag is informational only.
        assert_eq!(d.action, ActionKind::ShowMenu);
    }

    #[test]
    fn lead_window_extends_timeout() {
        let start = Utc::now() - Duration::hours(30);
        let mut c = ConversationContext::new("+5491111111111", start, Duration::hours(24));
        c.is_lead = true;
        c.lead_expires_at = Some(start + Duration::hours(72));
        let d = evaluator().evaluate(&c, "hola", Utc::now());
        assert!(!d.timeout_active);
    }

    #[test]
    fn future_handoff_is_system_error() {
        let now = Utc::now();
        let mut c = ctx(now);
        c.last_handoff_at = Some(now + Duration::hours(2));
        let d = evaluator().evaluate(&c, "hola", now);
        assert_eq!(d.action, ActionKind::Error);
        assert_eq!(d.reason, ReasonCode::SystemError);
        assert!(d.metadata["error"].as_str().unwrap().contains("future"));
        assert_eq!(d.metadata["antiloop_active"], true);
    }
}
