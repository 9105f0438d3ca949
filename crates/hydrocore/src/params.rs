//! Typed parameters for each block kind.
//!
//! Editors emit numbers both as JSON numbers and as numeric strings, so
//! numeric fields go through the lenient deserializers at the bottom.

use crate::{BlockError, ConditionConfig, DataType, LoopKind, Operator, Value};
use serde::{Deserialize, Deserializer, Serialize};

fn default_variable() -> String {
    "var1".to_string()
}

fn default_global_variable() -> String {
    "globalVar1".to_string()
}

fn default_true() -> bool {
    true
}

/// Returns the value of a required string parameter, treating empty strings as missing.
pub fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, BlockError> {
    value
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| BlockError::MissingParameter(name.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorParams {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_variable")]
    pub variable_name: String,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub monitoring_tag_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    On,
    Off,
    OnOffTimed,
    OffOnTimed,
    SetPower,
    FadeUp,
    FadeDown,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::On => "on",
            ActionType::Off => "off",
            ActionType::OnOffTimed => "on_off_timed",
            ActionType::OffOnTimed => "off_on_timed",
            ActionType::SetPower => "set_power",
            ActionType::FadeUp => "fade_up",
            ActionType::FadeDown => "fade_down",
        }
    }

    /// Timed actions hold one state for the duration and then send the opposite.
    pub fn is_timed(&self) -> bool {
        matches!(self, ActionType::OnOffTimed | ActionType::OffOnTimed)
    }

    /// The closing command of a timed action.
    pub fn closing_action(&self) -> Option<ActionType> {
        match self {
            ActionType::OnOffTimed => Some(ActionType::Off),
            ActionType::OffOnTimed => Some(ActionType::On),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorParams {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub action_type: Option<ActionType>,
    #[serde(default, deserialize_with = "lenient::f64")]
    pub duration: f64,
    #[serde(default, deserialize_with = "lenient::f64")]
    pub power_level: f64,
    #[serde(default, deserialize_with = "lenient::f64")]
    pub power_from: f64,
    #[serde(default, deserialize_with = "lenient::f64")]
    pub power_to: f64,
    #[serde(default)]
    pub use_global_variable: bool,
    #[serde(default = "default_global_variable")]
    pub selected_global_variable: String,
    #[serde(default = "default_true")]
    pub stop_on_disconnect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WaitParams {
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub duration: Option<f64>,
}

/// First entry of the editor's `conditions` array
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    #[serde(alias = "condition")]
    pub operator: Operator,
    #[serde(default)]
    pub data_type: DataType,
}

/// Operand settings shared by IF and LOOP blocks
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operands {
    #[serde(default = "default_variable", alias = "leftVariable")]
    pub variable: String,
    #[serde(default, alias = "manualComparisonValue", alias = "manualConditionValue")]
    pub comparison_value: Option<Value>,
    #[serde(default)]
    pub use_global_variable: bool,
    #[serde(default)]
    pub selected_global_variable: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IfParams {
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    #[serde(flatten)]
    pub operands: Operands,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopParams {
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    pub max_iterations: Option<u32>,
    #[serde(default, deserialize_with = "lenient::f64")]
    pub delay: f64,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    #[serde(flatten)]
    pub operands: Operands,
}

impl LoopParams {
    /// Repeat when only a bound is set, while when only a condition is set.
    pub fn kind(&self) -> LoopKind {
        match (self.conditions.is_empty(), self.max_iterations.is_some()) {
            (false, true) => LoopKind::WhileWithMax,
            (false, false) => LoopKind::While,
            (true, _) => LoopKind::Repeat,
        }
    }

    pub fn condition(&self, right_value: Value) -> Option<ConditionConfig> {
        self.conditions.first().map(|spec| ConditionConfig {
            left_variable: self.operands.variable.clone(),
            operator: spec.operator,
            right_value,
            data_type: spec.data_type,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GotoParams {
    #[serde(default)]
    pub target_block_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredType {
    #[default]
    Auto,
    Number,
    String,
    Boolean,
}

impl DeclaredType {
    /// Declarations without an explicit type are numeric.
    pub fn resolve(&self) -> DataType {
        match self {
            DeclaredType::Auto | DeclaredType::Number => DataType::Number,
            DeclaredType::String => DataType::String,
            DeclaredType::Boolean => DataType::Boolean,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVarNameParams {
    #[serde(default)]
    pub internal_var: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub data_type: DeclaredType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVarDataParams {
    #[serde(default)]
    pub variable_name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub source_variable: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    #[default]
    LogContinue,
    LogStop,
    Retry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryFallback {
    FallbackContinue,
    #[default]
    FallbackStop,
    FallbackEmergency,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    #[default]
    Continue,
    Stop,
    Pause,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    #[default]
    None,
    RestartModule,
    ClearContext,
    EmergencyStop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ErrorLogLevel {
    #[serde(rename = "all")]
    All,
    #[default]
    #[serde(rename = "criticalOnly")]
    CriticalOnly,
    #[serde(rename = "none")]
    Silent,
}

/// Settings of an error-handler block. Used both when the block runs in the
/// graph and when the interpreter applies it to a failed block it is linked to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlerParams {
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub enable_retry: bool,
    #[serde(default = "ErrorHandlerParams::default_max_retries", deserialize_with = "lenient::u32")]
    pub max_retries: u32,
    #[serde(default = "ErrorHandlerParams::default_retry_delay", deserialize_with = "lenient::f64")]
    pub retry_delay: f64,
    #[serde(default)]
    pub retry_fallback: RetryFallback,
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
    #[serde(default)]
    pub critical_errors: String,
    #[serde(default)]
    pub recovery_actions: RecoveryAction,
    #[serde(default)]
    pub log_level: ErrorLogLevel,
    #[serde(default)]
    pub user_message: String,
    #[serde(default)]
    pub enable_notification: bool,
    #[serde(default)]
    pub include_context_data: bool,
}

impl ErrorHandlerParams {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_retry_delay() -> f64 {
        5.0
    }

    pub fn retries_enabled(&self) -> bool {
        self.enable_retry || self.error_strategy == ErrorStrategy::Retry
    }

    /// Whether this handler sends its own notification instead of the automatic one.
    pub fn has_custom_notification(&self) -> bool {
        self.enable_notification && !self.user_message.trim().is_empty()
    }

    pub fn is_critical(&self, error_kind: &str) -> bool {
        self.critical_errors
            .split(',')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .any(|t| t.eq_ignore_ascii_case(error_kind))
    }
}

impl Default for ErrorHandlerParams {
    fn default() -> Self {
        Self {
            error_strategy: ErrorStrategy::default(),
            enable_retry: false,
            max_retries: Self::default_max_retries(),
            retry_delay: Self::default_retry_delay(),
            retry_fallback: RetryFallback::default(),
            fallback_strategy: FallbackStrategy::default(),
            critical_errors: String::new(),
            recovery_actions: RecoveryAction::default(),
            log_level: ErrorLogLevel::default(),
            user_message: String::new(),
            enable_notification: false,
            include_context_data: false,
        }
    }
}

mod lenient {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberLike {
        Number(f64),
        Text(String),
        Null(()),
    }

    fn parse<E: serde::de::Error>(raw: NumberLike) -> Result<Option<f64>, E> {
        match raw {
            NumberLike::Number(n) => Ok(Some(n)),
            NumberLike::Text(s) if s.trim().is_empty() => Ok(None),
            NumberLike::Text(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| E::custom(format!("expected a number, got {:?}", s))),
            NumberLike::Null(()) => Ok(None),
        }
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        parse(NumberLike::deserialize(d)?)
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(opt_f64(d)?.unwrap_or(0.0))
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(opt_f64(d)?.filter(|n| *n >= 0.0).map(|n| n as u64))
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        Ok(opt_f64(d)?.filter(|n| *n >= 0.0).map(|n| n as u32))
    }

    pub fn u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        Ok(opt_u32(d)?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> T {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn actuator_defaults() {
        let p: ActuatorParams = parse(json!({"deviceId": "pump-1", "actionType": "on_off_timed", "duration": "5"}));
        assert_eq!(p.action_type, Some(ActionType::OnOffTimed));
        assert_eq!(p.duration, 5.0);
        assert!(p.stop_on_disconnect);
        assert_eq!(p.selected_global_variable, "globalVar1");
        assert_eq!(ActionType::OnOffTimed.closing_action(), Some(ActionType::Off));
    }

    #[test]
    fn if_operands_accept_aliases() {
        let p: IfParams = parse(json!({
            "conditions": [{"condition": "greater_equal", "dataType": "number"}],
            "manualComparisonValue": 10,
            "tolerance": "0.5"
        }));
        assert_eq!(p.conditions[0].operator, Operator::GreaterEqual);
        assert_eq!(p.operands.variable, "var1");
        assert_eq!(p.operands.comparison_value, Some(Value::Number(10.0)));
        assert_eq!(p.operands.tolerance, 0.5);
    }

    #[test]
    fn loop_kind_follows_configuration() {
        let repeat: LoopParams = parse(json!({"maxIterations": 3}));
        assert_eq!(repeat.kind(), LoopKind::Repeat);
        let bounded: LoopParams = parse(json!({"maxIterations": 3, "conditions": [{"condition": "less_than"}]}));
        assert_eq!(bounded.kind(), LoopKind::WhileWithMax);
        let open: LoopParams = parse(json!({"conditions": [{"condition": "equals"}], "manualConditionValue": 1}));
        assert_eq!(open.kind(), LoopKind::While);
        assert_eq!(open.condition(Value::Number(1.0)).unwrap().left_variable, "var1");
    }

    #[test]
    fn error_handler_retry_switches() {
        let p: ErrorHandlerParams = parse(json!({"errorStrategy": "retry", "maxRetries": 2, "retryDelay": 0}));
        assert!(p.retries_enabled());
        assert_eq!(p.max_retries, 2);
        let p: ErrorHandlerParams = parse(json!({"criticalErrors": "hardware_failure, sensor_timeout"}));
        assert!(!p.retries_enabled());
        assert_eq!(p.max_retries, 3);
        assert!(p.is_critical("HARDWARE_FAILURE"));
        assert!(!p.is_critical("memory_limit"));
    }

    #[test]
    fn required_strings_reject_blank() {
        assert!(require(&Some("  ".into()), "deviceId").is_err());
        assert_eq!(require(&Some("d1".into()), "deviceId").unwrap(), "d1");
    }
}
