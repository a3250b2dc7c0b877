use anyhow::Result;
use reqwest::Client;
use serde_json::json;

use crate::oco::{BracketRequest, BracketResult, CancelOutcome, CloseReason, LegResult, OrderKind};

/// Operator notifications. Delivery failures are the caller's to log; they
/// never feed back into order state.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
            chat_id,
        }
    }

    pub async fn send_message(&self, message: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);

        self.client
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": message,
                "parse_mode": "HTML"
            }))
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn notify_startup(&self, testnet: bool) -> Result<()> {
        let network = if testnet { "TESTNET" } else { "MAINNET" };
        self.send_message(&format!(
            "🤖 <b>OCO manager started</b>\n\n🌐 Network: {}\n✅ Status: Running",
            network
        ))
        .await
    }

    pub async fn notify_shutdown(&self, tracked_symbols: usize) -> Result<()> {
        self.send_message(&format!(
            "🛑 <b>OCO manager stopped</b>\n\n📊 Symbols still tracked: {}",
            tracked_symbols
        ))
        .await
    }

    pub async fn notify_bracket(&self, request: &BracketRequest, result: &BracketResult) -> Result<()> {
        self.send_message(&format_bracket(request, result)).await
    }

    pub async fn notify_oco_triggered(
        &self,
        symbol: &str,
        filled_kind: OrderKind,
        order_id: &str,
        cancellations: &[CancelOutcome],
    ) -> Result<()> {
        let mut message = format!(
            "🔁 <b>OCO triggered</b>\n\n📊 Symbol: {}\n✅ Filled: {} ({})",
            symbol, filled_kind, order_id
        );
        push_cancellations(&mut message, cancellations);
        self.send_message(&message).await
    }

    pub async fn notify_position_closed(
        &self,
        symbol: &str,
        reason: &CloseReason,
        cancellations: &[CancelOutcome],
    ) -> Result<()> {
        let reason = match reason {
            CloseReason::Flat => "position flat on exchange".to_string(),
            CloseReason::QueryFailed(e) => format!("position query failed: {}", escape_html(&e.to_string())),
        };
        let mut message = format!(
            "🔒 <b>Position closed</b>\n\n📊 Symbol: {}\n📋 Reason: {}",
            symbol, reason
        );
        push_cancellations(&mut message, cancellations);
        self.send_message(&message).await
    }
}

/// Exchange error text may carry query strings (`&`) or angle brackets,
/// which Telegram's HTML parse mode rejects.
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn leg_line(label: &str, leg: Option<&LegResult>) -> String {
    match leg {
        None => format!("➖ {}: not requested", label),
        Some(Ok(ack)) => format!("✅ {}: {}", label, ack.order_id),
        Some(Err(e)) => format!("❌ {}: {}", label, escape_html(&e.to_string())),
    }
}

fn format_bracket(request: &BracketRequest, result: &BracketResult) -> String {
    let emoji = match request.direction {
        crate::exchange::PositionSide::Long => "🟢",
        crate::exchange::PositionSide::Short => "🔴",
    };
    let mut message = format!(
        "📤 <b>Bracket</b>\n\n📊 Symbol: {}\n{} Side: <b>{}</b>\n🔢 Qty: {:.4}\n",
        request.symbol, emoji, request.direction, request.quantity
    );
    message.push_str(&leg_line("Main", Some(&result.main_order)));
    message.push('\n');
    message.push_str(&leg_line("Take profit", result.take_profit_order.as_ref()));
    message.push('\n');
    message.push_str(&leg_line("Stop loss", result.stop_loss_order.as_ref()));
    if let Some(confirmation) = result.confirmation {
        message.push_str(&format!("\n🧾 Position: {:?}", confirmation));
    }
    message
}

fn push_cancellations(message: &mut String, cancellations: &[CancelOutcome]) {
    for c in cancellations {
        match &c.result {
            Ok(()) => message.push_str(&format!("\n🚫 Cancelled {} ({})", c.kind, c.order_id)),
            Err(e) => message.push_str(&format!(
                "\n⚠️ Cancel failed {} ({}): {}",
                c.kind,
                c.order_id,
                escape_html(&e.to_string())
            )),
        }
    }
}
