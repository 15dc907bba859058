//! Action executor: renders a decision into reply text and the durable
//! side effects the persistor has to apply. No I/O happens here.

use crate::pipeline::area::{Area, ROOT_MENU};
use crate::pipeline::types::{
    ActionKind, ConversationContext, Decision, HandoffRequest, MenuReset,
    PersistenceInstructions, RenderedAction,
};

const MENU_HEADER: &str = "¡Hola! 👋 ¿En qué podemos ayudarte?";
const MENU_FOOTER: &str = "Respondé con el número de la opción.";

pub const TIMEOUT_TEXT: &str =
    "La ventana de conversación expiró. Enviá MENU para continuar.";

pub const ERROR_TEXT: &str =
    "Tuvimos un problema procesando tu mensaje. Intentá de nuevo en unos minutos o enviá MENU.";

/// Root menu listing every option.
pub fn root_menu_text() -> String {
    let options: Vec<String> = ROOT_MENU
        .iter()
        .map(|opt| format!("{}. {}", opt.number, opt.area.display_name()))
        .collect();
    format!("{MENU_HEADER}\n\n{}\n\n{MENU_FOOTER}", options.join("\n"))
}

pub fn handoff_text(destination: Area) -> String {
    format!(
        "Te derivamos con {}. En breve una persona del equipo te va a responder.",
        destination.display_name()
    )
}

pub fn courtesy_text(area: Area) -> String {
    format!(
        "Ya te derivamos con {}, un agente te va a responder a la brevedad. 🙌",
        area.display_name()
    )
}

#[derive(Debug, Clone, Default)]
pub struct ActionExecutor;

impl ActionExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(&self, decision: &Decision, ctx: &ConversationContext) -> RenderedAction {
        let metadata = serde_json::json!({
            "reason": decision.reason.as_str(),
            "antiloop_active": decision.antiloop_active,
            "timeout_active": decision.timeout_active,
        });

        match decision.action {
            ActionKind::ShowMenu => RenderedAction {
                action: ActionKind::ShowMenu,
                text: root_menu_text(),
                requires_persistence: true,
                persistence: PersistenceInstructions {
                    menu_reset: Some(MenuReset::Root),
                    deactivate_proxy: decision.deactivate_proxy,
                    count_automatic: true,
                    ..Default::default()
                },
                metadata,
            },
            ActionKind::HandOff => match decision.target {
                Some(destination) => RenderedAction {
                    action: ActionKind::HandOff,
                    text: handoff_text(destination),
                    requires_persistence: true,
                    persistence: PersistenceInstructions {
                        menu_reset: Some(MenuReset::Cleared),
                        handoff: Some(HandoffRequest {
                            origin: ctx.area,
                            destination,
                            sub_label: decision.sub_label.clone(),
                            reason: decision.reason,
                            create_ticket: true,
                        }),
                        last_option: decision.selected_option,
                        count_automatic: true,
                        ..Default::default()
                    },
                    metadata,
                },
                None => {
                    tracing::warn!(contact = %ctx.contact, "Handoff decision without a target");
                    self.error(metadata)
                }
            },
            ActionKind::ContinueHuman => RenderedAction {
                action: ActionKind::ContinueHuman,
                text: String::new(),
                requires_persistence: false,
                persistence: PersistenceInstructions::default(),
                metadata,
            },
            ActionKind::Courtesy => RenderedAction {
                action: ActionKind::Courtesy,
                text: courtesy_text(decision.target.unwrap_or(ctx.area)),
                requires_persistence: true,
                persistence: PersistenceInstructions {
                    count_automatic: true,
                    ..Default::default()
                },
                metadata,
            },
            ActionKind::Timeout => RenderedAction {
                action: ActionKind::Timeout,
                text: TIMEOUT_TEXT.to_string(),
                requires_persistence: true,
                persistence: PersistenceInstructions {
                    menu_reset: Some(MenuReset::Root),
                    count_automatic: true,
                    ..Default::default()
                },
                metadata,
            },
            ActionKind::Error => self.error(metadata),
        }
    }

    fn error(&self, metadata: serde_json::Value) -> RenderedAction {
        RenderedAction {
            action: ActionKind::Error,
            text: ERROR_TEXT.to_string(),
            requires_persistence: true,
            persistence: PersistenceInstructions::default(),
            metadata,
        }
    }
}
