//! Fitted-model registry
//!
//! Market-curve models persist one row per `(target, version)`; tree
//! models one row per `(account, kind, version)`. Later builds supersede
//! earlier ones, nothing is mutated in place.

use crate::decision_tree::{DecisionTreeModel, PredictionKind};
use crate::market_curve::MarketCurveModel;
use crate::models::TargetType;
use crate::store::Database;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

#[derive(Clone)]
pub struct ModelRegistry {
    db: Database,
}

impl ModelRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a new curve model version for a target and return it.
    pub fn save_curve_model(
        &self,
        account_id: i64,
        target_id: i64,
        target_type: TargetType,
        model: &MarketCurveModel,
    ) -> Result<i64> {
        let json = serde_json::to_string(model).context("failed to serialize curve model")?;
        let conn = self.db.lock();
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM curve_models WHERE target_id = ?1",
            params![target_id],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO curve_models
               (account_id, target_id, target_type, version, model_json, fitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account_id,
                target_id,
                target_type.as_str(),
                version,
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(version)
    }

    pub fn latest_curve_model(&self, target_id: i64) -> Result<Option<(i64, MarketCurveModel)>> {
        let conn = self.db.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, model_json FROM curve_models
                 WHERE target_id = ?1 ORDER BY version DESC LIMIT 1",
                params![target_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(version, json)| {
            serde_json::from_str(&json).ok().map(|m| (version, m))
        }))
    }

    pub fn save_tree_model(&self, account_id: i64, model: &DecisionTreeModel) -> Result<i64> {
        let json = serde_json::to_string(model).context("failed to serialize tree model")?;
        let kind = match model.kind {
            PredictionKind::CrPrediction => "cr_prediction",
            PredictionKind::CvPrediction => "cv_prediction",
        };
        let conn = self.db.lock();
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM tree_models
             WHERE account_id = ?1 AND kind = ?2",
            params![account_id, kind],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO tree_models
               (account_id, kind, version, status, model_json, trained_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                account_id,
                kind,
                version,
                match model.status {
                    crate::decision_tree::ModelStatus::Ready => "ready",
                    crate::decision_tree::ModelStatus::Degraded => "degraded",
                },
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(version)
    }

    pub fn latest_tree_model(
        &self,
        account_id: i64,
        kind: PredictionKind,
    ) -> Result<Option<(i64, DecisionTreeModel)>> {
        let kind = match kind {
            PredictionKind::CrPrediction => "cr_prediction",
            PredictionKind::CvPrediction => "cv_prediction",
        };
        let conn = self.db.lock();
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, model_json FROM tree_models
                 WHERE account_id = ?1 AND kind = ?2 ORDER BY version DESC LIMIT 1",
                params![account_id, kind],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(version, json)| {
            serde_json::from_str(&json).ok().map(|m| (version, m))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_tree::{DecisionTreeConfig, KeywordFeatures, KeywordType, TrainingSample};
    use crate::market_curve::{BidSample, CurveFitter};
    use crate::models::{AlgorithmParams, MatchType};

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Database::open_in_memory().unwrap())
    }

    fn fitted_model() -> MarketCurveModel {
        let fitter = CurveFitter::new(&AlgorithmParams::default());
        let samples: Vec<BidSample> = (1..=8)
            .map(|i| BidSample {
                bid: i as f64 * 0.25,
                impressions: 100.0 * i as f64,
                clicks: 5.0 * i as f64,
                spend: i as f64,
                sales: 10.0 * i as f64,
                orders: i as f64,
            })
            .collect();
        fitter.fit(&samples, 30).unwrap()
    }

    #[test]
    fn test_curve_versions_increment() {
        let r = registry();
        let model = fitted_model();
        assert_eq!(
            r.save_curve_model(1, 42, TargetType::Keyword, &model).unwrap(),
            1
        );
        assert_eq!(
            r.save_curve_model(1, 42, TargetType::Keyword, &model).unwrap(),
            2
        );
        // Another target starts its own version sequence.
        assert_eq!(
            r.save_curve_model(1, 43, TargetType::Keyword, &model).unwrap(),
            1
        );

        let (version, loaded) = r.latest_curve_model(42).unwrap().unwrap();
        assert_eq!(version, 2);
        assert_eq!(loaded.data_points, model.data_points);
        assert!(r.latest_curve_model(99).unwrap().is_none());
    }

    #[test]
    fn test_tree_model_roundtrip_keeps_status() {
        let r = registry();
        let samples = vec![
            TrainingSample {
                features: KeywordFeatures {
                    match_type: MatchType::Exact,
                    word_count: 2,
                    keyword_type: KeywordType::Generic,
                    avg_bid: 1.0,
                },
                value: 0.1,
            };
            10
        ];
        let model = DecisionTreeModel::train(
            PredictionKind::CrPrediction,
            &samples,
            DecisionTreeConfig::default(),
        );
        r.save_tree_model(1, &model).unwrap();

        let (version, loaded) = r
            .latest_tree_model(1, PredictionKind::CrPrediction)
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(loaded.status, crate::decision_tree::ModelStatus::Degraded);
        assert!(r
            .latest_tree_model(1, PredictionKind::CvPrediction)
            .unwrap()
            .is_none());
    }
}
