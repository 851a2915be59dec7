//! Concrete simulation events and the tag-driven factory that builds them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{SimResult, SimulationError};

/// Closed set of event kinds understood by the simulation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// Marketing push toward a client segment.
    #[serde(rename = "MarketingCampaignEvent")]
    MarketingCampaign,
    /// Closure of a physical branch.
    #[serde(rename = "BranchClosureEvent")]
    BranchClosure,
    /// Launch of a new banking product.
    #[serde(rename = "ProductLaunchEvent")]
    ProductLaunch,
    /// Move made by a competing bank.
    #[serde(rename = "CompetitorActionEvent")]
    CompetitorAction,
    /// Macroeconomic shock.
    #[serde(rename = "EconomicShockEvent")]
    EconomicShock,
    /// New or amended regulation.
    #[serde(rename = "RegulatoryChangeEvent")]
    RegulatoryChange,
    /// Rollout of a digital service.
    #[serde(rename = "DigitalTransformationEvent")]
    DigitalTransformation,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::MarketingCampaign,
        Self::BranchClosure,
        Self::ProductLaunch,
        Self::CompetitorAction,
        Self::EconomicShock,
        Self::RegulatoryChange,
        Self::DigitalTransformation,
    ];

    /// Wire tag, as used in scenario files and exports.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::MarketingCampaign => "MarketingCampaignEvent",
            Self::BranchClosure => "BranchClosureEvent",
            Self::ProductLaunch => "ProductLaunchEvent",
            Self::CompetitorAction => "CompetitorActionEvent",
            Self::EconomicShock => "EconomicShockEvent",
            Self::RegulatoryChange => "RegulatoryChangeEvent",
            Self::DigitalTransformation => "DigitalTransformationEvent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for EventKind {
    type Err = SimulationError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or_else(|| SimulationError::UnknownEventType(tag.to_string()))
    }
}

/// Marketing campaign parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketingCampaign {
    /// Client segment targeted.
    pub target_segment: String,
    /// Campaign flavour, e.g. `digital_banking_promotion`.
    pub campaign_type: String,
    /// Relative strength of the push.
    pub intensity: f64,
    /// Length of the campaign in steps.
    pub duration: u64,
    /// Budget in local currency.
    pub budget: f64,
    /// Channels used.
    pub channels: Vec<String>,
    /// Headline message.
    pub message: String,
}

/// Branch closure parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchClosure {
    /// Branch location.
    pub location: String,
    /// Branches clients are redirected to.
    pub alternative_branches: Vec<String>,
    /// Whether clients are compensated.
    pub compensation_offered: bool,
    /// Calendar date of the closure.
    pub closure_date: String,
    /// Whether clients get help moving to digital channels.
    pub digital_migration_support: bool,
    /// Where staff are reassigned.
    pub staff_reallocation: String,
    /// Stated reason.
    pub reason: String,
}

/// Product launch parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductLaunch {
    /// Product family, e.g. `mobile_wallet`.
    pub product_type: String,
    /// Market addressed.
    pub target_market: String,
    /// Price point.
    pub pricing: f64,
    /// Whether the product is only sold through digital channels.
    pub digital_only: bool,
    /// Governorates where the launch happens first.
    pub launch_governorates: Vec<String>,
}

/// Competitor action parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompetitorAction {
    /// Acting competitor.
    pub competitor_name: String,
    /// Kind of action, e.g. `rate_cut`.
    pub action_type: String,
    /// Region affected.
    pub affected_region: String,
    /// Strength of the impact.
    pub impact_intensity: f64,
    /// Length of the action in steps.
    pub duration: u64,
    /// Offer made to clients.
    pub competitor_offer: String,
}

/// Economic shock parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomicShock {
    /// Kind of shock, e.g. `inflation_spike`.
    pub shock_type: String,
    /// Severity of the shock.
    pub severity: f64,
    /// Sectors hit.
    pub affected_sectors: Vec<String>,
    /// Length of the shock in steps.
    pub duration: u64,
}

/// Regulatory change parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatoryChange {
    /// Regulation family.
    pub regulation_type: String,
    /// Products affected.
    pub affected_products: Vec<String>,
    /// Compliance deadline date.
    pub compliance_deadline: String,
    /// Severity of the impact.
    pub impact_severity: f64,
}

/// Digital transformation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalTransformation {
    /// Service being digitised.
    pub service_type: String,
    /// Delivery channel.
    pub channel: String,
    /// Expected user experience score.
    pub user_experience_score: f64,
    /// Number of rollout phases.
    pub rollout_phases: u32,
    /// Regions covered.
    pub target_regions: Vec<String>,
    /// Features shipped.
    pub features: Vec<String>,
}

impl Default for DigitalTransformation {
    fn default() -> Self {
        Self {
            service_type: String::new(),
            channel: String::new(),
            user_experience_score: 0.0,
            rollout_phases: 1,
            target_regions: Vec::new(),
            features: Vec::new(),
        }
    }
}

/// Variant-specific part of an event. The serialized tag is the event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    /// See [`MarketingCampaign`].
    #[serde(rename = "MarketingCampaignEvent")]
    MarketingCampaign(MarketingCampaign),
    /// See [`BranchClosure`].
    #[serde(rename = "BranchClosureEvent")]
    BranchClosure(BranchClosure),
    /// See [`ProductLaunch`].
    #[serde(rename = "ProductLaunchEvent")]
    ProductLaunch(ProductLaunch),
    /// See [`CompetitorAction`].
    #[serde(rename = "CompetitorActionEvent")]
    CompetitorAction(CompetitorAction),
    /// See [`EconomicShock`].
    #[serde(rename = "EconomicShockEvent")]
    EconomicShock(EconomicShock),
    /// See [`RegulatoryChange`].
    #[serde(rename = "RegulatoryChangeEvent")]
    RegulatoryChange(RegulatoryChange),
    /// See [`DigitalTransformation`].
    #[serde(rename = "DigitalTransformationEvent")]
    DigitalTransformation(DigitalTransformation),
}

impl EventPayload {
    /// Kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::MarketingCampaign(_) => EventKind::MarketingCampaign,
            Self::BranchClosure(_) => EventKind::BranchClosure,
            Self::ProductLaunch(_) => EventKind::ProductLaunch,
            Self::CompetitorAction(_) => EventKind::CompetitorAction,
            Self::EconomicShock(_) => EventKind::EconomicShock,
            Self::RegulatoryChange(_) => EventKind::RegulatoryChange,
            Self::DigitalTransformation(_) => EventKind::DigitalTransformation,
        }
    }

    /// Builds the payload of `kind` from a loose parameter map. Missing keys take
    /// their defaults; keys the kind does not know are ignored.
    pub fn from_parameters(kind: EventKind, parameters: &IndexMap<String, Value>) -> SimResult<Self> {
        let value = Value::Object(
            parameters
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        );
        Ok(match kind {
            EventKind::MarketingCampaign => Self::MarketingCampaign(decode(kind, value)?),
            EventKind::BranchClosure => Self::BranchClosure(decode(kind, value)?),
            EventKind::ProductLaunch => Self::ProductLaunch(decode(kind, value)?),
            EventKind::CompetitorAction => Self::CompetitorAction(decode(kind, value)?),
            EventKind::EconomicShock => Self::EconomicShock(decode(kind, value)?),
            EventKind::RegulatoryChange => Self::RegulatoryChange(decode(kind, value)?),
            EventKind::DigitalTransformation => Self::DigitalTransformation(decode(kind, value)?),
        })
    }
}

fn decode<T: DeserializeOwned>(kind: EventKind, value: Value) -> SimResult<T> {
    serde_json::from_value(value).map_err(|err| SimulationError::InvalidEventParameters {
        event_type: kind.tag().to_string(),
        reason: err.to_string(),
    })
}

macro_rules! payload_from {
    ($($variant:ident),+ $(,)?) => {
        $(
            impl From<$variant> for EventPayload {
                fn from(payload: $variant) -> Self {
                    Self::$variant(payload)
                }
            }
        )+
    };
}

payload_from!(
    MarketingCampaign,
    BranchClosure,
    ProductLaunch,
    CompetitorAction,
    EconomicShock,
    RegulatoryChange,
    DigitalTransformation,
);

/// One step-stamped simulation occurrence.
///
/// Events are immutable once built and deliberately not `Clone`: the event
/// system owns each one from injection until it lands in a log, so an id can
/// only ever be in one place.
#[derive(Debug, PartialEq, Serialize)]
pub struct Event {
    event_id: Uuid,
    step: u64,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    payload: EventPayload,
}

impl Event {
    /// Creates an event eligible for dispatch at `step`.
    #[must_use]
    pub fn new(step: u64, payload: impl Into<EventPayload>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            step,
            created_at: Utc::now(),
            payload: payload.into(),
        }
    }

    /// Unique id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.event_id
    }

    /// Step at which the event becomes due.
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Kind, derived from the payload variant.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Wire tag of the kind.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.kind().tag()
    }

    /// Variant-specific fields.
    #[must_use]
    pub const fn payload(&self) -> &EventPayload {
        &self.payload
    }
}

/// Builds a concrete event from a type tag and generic parameters.
///
/// This is how string-keyed descriptions loaded from scenario files become
/// dispatchable events.
pub fn create_event(
    event_type: &str,
    step: u64,
    parameters: &IndexMap<String, Value>,
) -> SimResult<Event> {
    let kind: EventKind = event_type.parse()?;
    let payload = EventPayload::from_parameters(kind, parameters)?;
    Ok(Event::new(step, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;
    use serde_json::json;

    #[test]
    fn factory_builds_variant_from_parameters() {
        let params = indexmap! {
            "target_segment".to_string() => json!("young_professionals"),
            "intensity".to_string() => json!(0.8),
            "budget".to_string() => json!(50_000.0),
        };
        let event = create_event("MarketingCampaignEvent", 5, &params).unwrap();
        assert_eq!(event.step(), 5);
        assert_eq!(event.kind(), EventKind::MarketingCampaign);
        match event.payload() {
            EventPayload::MarketingCampaign(campaign) => {
                assert_eq!(campaign.target_segment, "young_professionals");
                assert!((campaign.intensity - 0.8).abs() < f64::EPSILON);
                assert!(campaign.channels.is_empty());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn factory_rejects_unknown_tag() {
        let err = create_event("AlienInvasionEvent", 1, &IndexMap::new()).unwrap_err();
        assert!(matches!(err, SimulationError::UnknownEventType(ref tag) if tag == "AlienInvasionEvent"));
        assert!(err.to_string().contains("AlienInvasionEvent"));
    }

    #[test]
    fn factory_rejects_ill_typed_parameters() {
        let params = indexmap! { "compensation_offered".to_string() => json!("maybe") };
        let err = create_event("BranchClosureEvent", 2, &params).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::InvalidEventParameters { ref event_type, .. } if event_type == "BranchClosureEvent"
        ));
    }

    #[test]
    fn digital_transformation_defaults_to_single_phase() {
        let event = create_event("DigitalTransformationEvent", 0, &IndexMap::new()).unwrap();
        match event.payload() {
            EventPayload::DigitalTransformation(rollout) => assert_eq!(rollout.rollout_phases, 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn every_tag_parses_back_to_its_kind() {
        for kind in EventKind::ALL {
            assert_eq!(kind.tag().parse::<EventKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), kind.tag());
        }
    }

    #[test]
    fn serialized_event_is_flat_with_type_tag() {
        let event = Event::new(
            10,
            BranchClosure {
                location: "Sfax".into(),
                alternative_branches: vec!["Sousse".into()],
                compensation_offered: true,
                ..BranchClosure::default()
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], json!("BranchClosureEvent"));
        assert_eq!(value["step"], json!(10));
        assert_eq!(value["location"], json!("Sfax"));
        assert_eq!(value["event_id"], json!(event.id().to_string()));
    }
}
