//! The proxied operation table.
//!
//! Each row names the wire operation, the request variant, the
//! [`ConsulClient`] method it forwards to, its arguments and its result type.
//! The request enum, the service-side dispatch and the typed
//! [`ServiceProxy`] methods are all generated from this one table, so the
//! three can never disagree.

use client_sdk::{ConsulClient, ConsulError};
use common::{AclToken, CheckInfo, CheckOptions, Event, KeyValuePair, ServiceInfo, ServiceOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ServiceProxy;

macro_rules! consul_operations {
    ($(
        $(#[$doc:meta])*
        $op:literal => $variant:ident :: $method:ident($($arg:ident: $ty:ty),*) -> $ret:ty;
    )+) => {
        /// A client operation with its arguments, tagged by operation name:
        /// `{"op": "getValue", "args": {"key": "foo/bar"}}`.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "op", content = "args", rename_all_fields = "camelCase")]
        pub enum ConsulRequest {
            $(
                $(#[$doc])*
                #[serde(rename = $op)]
                $variant { $($arg: $ty),* },
            )+
        }

        impl ConsulRequest {
            pub fn operation(&self) -> &'static str {
                match self {
                    $(Self::$variant { .. } => $op,)+
                }
            }
        }

        pub(crate) async fn dispatch_to_client(
            client: &ConsulClient,
            request: ConsulRequest,
        ) -> Result<Value, ConsulError> {
            match request {
                $(
                    ConsulRequest::$variant { $($arg),* } => {
                        let output: $ret = client.$method($(&$arg),*).await?;
                        Ok(serde_json::to_value(output)?)
                    }
                )+
            }
        }

        impl ServiceProxy {
            $(
                $(#[$doc])*
                pub async fn $method(&self, $($arg: $ty),*) -> Result<$ret, ConsulError> {
                    let value = self.call(ConsulRequest::$variant { $($arg),* }).await?;
                    Ok(serde_json::from_value(value)?)
                }
            )+
        }
    };
}

consul_operations! {
    "putValue" => PutValue::put_value(key: String, value: String) -> ();
    "getValue" => GetValue::get_value(key: String) -> KeyValuePair;
    /// Every pair whose key starts with `key_prefix`; empty when none match.
    "getValues" => GetValues::get_values(key_prefix: String) -> Vec<KeyValuePair>;
    "deleteValue" => DeleteValue::delete_value(key: String) -> ();
    "deleteValues" => DeleteValues::delete_values(key_prefix: String) -> ();

    /// Fires an event; the returned copy carries the agent-assigned id.
    "fireEvent" => FireEvent::fire_event(event: Event) -> Event;
    "listEvents" => ListEvents::list_events() -> Vec<Event>;

    "registerService" => RegisterService::register_service(service: ServiceOptions) -> ();
    "deregisterService" => DeregisterService::deregister_service(id: String) -> ();
    "localServices" => LocalServices::local_services() -> Vec<ServiceInfo>;
    /// Catalog-wide instances of the named service.
    "infoService" => InfoService::info_service(name: String) -> Vec<ServiceInfo>;

    "registerCheck" => RegisterCheck::register_check(check: CheckOptions) -> ();
    "deregisterCheck" => DeregisterCheck::deregister_check(id: String) -> ();
    "passCheck" => PassCheck::pass_check(id: String) -> ();
    "passCheckWithNote" => PassCheckWithNote::pass_check_with_note(id: String, note: String) -> ();
    "warnCheck" => WarnCheck::warn_check(id: String) -> ();
    "warnCheckWithNote" => WarnCheckWithNote::warn_check_with_note(id: String, note: String) -> ();
    "failCheck" => FailCheck::fail_check(id: String) -> ();
    "failCheckWithNote" => FailCheckWithNote::fail_check_with_note(id: String, note: String) -> ();
    "updateCheck" => UpdateCheck::update_check(check: CheckInfo) -> ();
    "localChecks" => LocalChecks::local_checks() -> Vec<CheckInfo>;

    /// Creates a token and returns the id the agent assigned to it.
    "createAclToken" => CreateAclToken::create_acl_token(token: AclToken) -> String;
    "infoAclToken" => InfoAclToken::info_acl_token(id: String) -> AclToken;
    "listAclTokens" => ListAclTokens::list_acl_tokens() -> Vec<AclToken>;
    "destroyAclToken" => DestroyAclToken::destroy_acl_token(id: String) -> ();
}
