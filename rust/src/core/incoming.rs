use serde_json::Value;

use super::AppCore;
use crate::state::{CallType, IncomingCallState};
use crate::updates::AppUpdate;

const UNKNOWN_CALLER: &str = "Unknown caller";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum OfferRejection {
    #[error("offer has no usable callId")]
    MissingCallId,
    #[error("offer has no usable callerId")]
    MissingCallerId,
}

/// A ringing call pushed over signaling. Channel credentials in the payload are not
/// kept: accepting always fetches fresh ones through `join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IncomingCallOffer {
    pub call_id: String,
    pub caller_id: String,
    pub caller_name: String,
    pub caller_avatar: Option<String>,
    pub call_type: CallType,
    pub channel_name: Option<String>,
}

fn non_empty_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

impl IncomingCallOffer {
    pub fn from_payload(payload: &Value) -> Result<Self, OfferRejection> {
        let call_id = non_empty_str(payload, "callId").ok_or(OfferRejection::MissingCallId)?;
        let caller_id =
            non_empty_str(payload, "callerId").ok_or(OfferRejection::MissingCallerId)?;
        Ok(Self {
            call_id,
            caller_id,
            caller_name: non_empty_str(payload, "callerName")
                .unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
            caller_avatar: non_empty_str(payload, "callerAvatar"),
            call_type: CallType::parse_lenient(payload.get("callType").and_then(Value::as_str)),
            channel_name: non_empty_str(payload, "channelName"),
        })
    }

    pub fn to_state(&self) -> IncomingCallState {
        IncomingCallState {
            call_id: self.call_id.clone(),
            caller_id: self.caller_id.clone(),
            caller_name: self.caller_name.clone(),
            caller_avatar: self.caller_avatar.clone(),
            call_type: self.call_type,
        }
    }
}

impl AppCore {
    pub(super) fn handle_incoming_call_payload(&mut self, payload: Value) {
        let offer = match IncomingCallOffer::from_payload(&payload) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(%e, "dropping invalid incoming call offer");
                return;
            }
        };
        if self
            .presented_offer
            .as_ref()
            .is_some_and(|o| o.call_id == offer.call_id)
        {
            tracing::debug!(call_id = %offer.call_id, "duplicate incoming call offer");
            return;
        }
        if self
            .state
            .active_call
            .as_ref()
            .is_some_and(|c| c.call_id == offer.call_id)
        {
            tracing::debug!(call_id = %offer.call_id, "offer for the current call ignored");
            return;
        }
        if let Some(previous) = self.presented_offer.take() {
            tracing::info!(
                previous = %previous.call_id,
                call_id = %offer.call_id,
                "incoming call offer superseded"
            );
        }

        tracing::info!(
            call_id = %offer.call_id,
            caller_id = %offer.caller_id,
            call_type = offer.call_type.as_str(),
            "incoming call"
        );
        self.state.incoming_call = Some(offer.to_state());
        self.presented_offer = Some(offer.clone());
        self.emit_state();

        if !self.app_foreground {
            self.emit_incoming_call_alert(&offer);
        }
    }

    /// Drops the presented offer if it is `call_id`. Returns whether it was.
    pub(super) fn dismiss_offer(&mut self, call_id: &str) -> bool {
        if !self
            .presented_offer
            .as_ref()
            .is_some_and(|o| o.call_id == call_id)
        {
            return false;
        }
        self.presented_offer = None;
        self.state.incoming_call = None;
        self.emit_state();
        true
    }

    fn emit_incoming_call_alert(&mut self, offer: &IncomingCallOffer) {
        let rev = self.next_rev();
        // Keep snapshot rev in sync with the update stream even though this is a side-effect update.
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::IncomingCallAlert {
            rev,
            call_id: offer.call_id.clone(),
            caller_name: offer.caller_name.clone(),
            call_type: offer.call_type,
        });
    }

    pub(super) fn handle_accept_incoming_call(&mut self, call_id: String) {
        let offer = match self.presented_offer.take() {
            Some(offer) if offer.call_id == call_id => offer,
            other => {
                self.presented_offer = other;
                self.toast("This call is no longer available");
                return;
            }
        };
        self.state.incoming_call = None;
        tracing::info!(call_id = %offer.call_id, channel = ?offer.channel_name, "accepting incoming call");
        self.emit_state();
        self.begin_incoming_call(offer);
    }

    pub(super) fn handle_decline_incoming_call(&mut self, call_id: String) {
        self.dismiss_offer(&call_id);
        let backend = self.backend.clone();
        self.runtime.spawn(async move {
            match backend.decline_call(&call_id).await {
                Ok(()) => tracing::info!(call_id = %call_id, "declined incoming call"),
                Err(e) => tracing::warn!(call_id = %call_id, %e, "decline request failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_offer_is_parsed_with_defaults() {
        let offer = IncomingCallOffer::from_payload(&serde_json::json!({
            "callId": "C1",
            "callerId": "doc-1",
            "callType": "video",
            "channelName": "ch-1",
            "token": "secret"
        }))
        .unwrap();
        assert_eq!(offer.call_id, "C1");
        assert_eq!(offer.caller_name, UNKNOWN_CALLER);
        assert_eq!(offer.call_type, CallType::Video);
        assert_eq!(offer.channel_name.as_deref(), Some("ch-1"));
    }

    #[test]
    fn offers_without_ids_are_rejected() {
        let cases = [
            (serde_json::json!({"callerId": "d"}), OfferRejection::MissingCallId),
            (serde_json::json!({"callId": "", "callerId": "d"}), OfferRejection::MissingCallId),
            (serde_json::json!({"callId": 12, "callerId": "d"}), OfferRejection::MissingCallId),
            (serde_json::json!({"callId": "C1"}), OfferRejection::MissingCallerId),
            (serde_json::json!({"callId": "C1", "callerId": "  "}), OfferRejection::MissingCallerId),
            (serde_json::json!(null), OfferRejection::MissingCallId),
        ];
        for (payload, expected) in cases {
            assert_eq!(
                IncomingCallOffer::from_payload(&payload),
                Err(expected),
                "{payload}"
            );
        }
    }
}
