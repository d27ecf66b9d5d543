use crate::config::{validate_tolerance, Config, ConfigError};
use crate::store::{Identity, Store, StoreError};
use chrono::Utc;
use facescan_core::opencv::system_frontalface;
use facescan_core::{find_match, DetectorError, FaceDetector, HaarCascade};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("name is required")]
    NameRequired,
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("user {0:?} already exists")]
    DuplicateName(String),
    #[error("no enrolled users found")]
    NoEnrolledIdentities,
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("detector: {0}")]
    Detector(DetectorError),
    #[error("store: {0}")]
    Store(StoreError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

impl From<DetectorError> for RegistryError {
    fn from(e: DetectorError) -> Self {
        if e.is_no_face() {
            RegistryError::NoFaceDetected
        } else {
            RegistryError::Detector(e)
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateName(name) => RegistryError::DuplicateName(name),
            other => RegistryError::Store(other),
        }
    }
}

/// Result of a verification attempt that found a face.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Authenticated { identity: Identity, confidence: f64 },
    NotRecognized,
}

/// Enrollment and verification over a detector and an identity store.
pub struct Registry {
    detector: FaceDetector,
    store: Store,
    tolerance: f64,
}

impl Registry {
    /// Build a registry; `tolerance` must lie in (0, 1].
    pub fn new(detector: FaceDetector, store: Store, tolerance: f64) -> Result<Self, RegistryError> {
        validate_tolerance(tolerance)?;
        Ok(Self {
            detector,
            store,
            tolerance,
        })
    }

    /// Open the configured database with the configured cascade, else an
    /// installed OpenCV frontal-face cascade, else the bundled one.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        config.validate()?;
        let params = config.detector_params();
        let cascade = match config.cascade_path.clone().or_else(system_frontalface) {
            Some(path) => HaarCascade::from_path(&path),
            None => {
                tracing::info!("no cascade configured or installed; using the bundled classifier");
                HaarCascade::bundled()
            }
        }
        .map_err(DetectorError::from)?;
        let detector = FaceDetector::new(cascade, params)?;
        let store = Store::open(&config.db_path)?;
        Self::new(detector, store, config.tolerance)
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Enroll the largest face in `image_bytes` under `name`.
    pub fn enroll(&mut self, image_bytes: &[u8], name: &str) -> Result<Identity, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::NameRequired);
        }

        let vector = self.detector.detect_and_encode(image_bytes)?;

        if self.store.find_by_name(name)?.is_some() {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.store.insert(&identity, &vector)?;

        tracing::info!(id = %identity.id, name = %identity.name, "identity enrolled");
        Ok(identity)
    }

    /// Match the largest face in `image_bytes` against every enrolled identity.
    pub fn verify(&self, image_bytes: &[u8]) -> Result<VerifyOutcome, RegistryError> {
        let query = self.detector.detect_and_encode(image_bytes)?;

        let candidates = self.store.candidates()?;
        if candidates.is_empty() {
            return Err(RegistryError::NoEnrolledIdentities);
        }

        let Some(matched) = find_match(&query, &candidates, self.tolerance) else {
            tracing::info!(candidates = candidates.len(), "face not recognized");
            return Ok(VerifyOutcome::NotRecognized);
        };

        // The identity may have been removed since the snapshot was taken.
        match self.store.get(&matched.identity)? {
            Some(identity) => {
                tracing::info!(
                    id = %identity.id,
                    name = %identity.name,
                    confidence = matched.confidence,
                    "face authenticated"
                );
                Ok(VerifyOutcome::Authenticated {
                    identity,
                    confidence: matched.confidence,
                })
            }
            None => Ok(VerifyOutcome::NotRecognized),
        }
    }

    /// All identities in enrollment order.
    pub fn list(&self) -> Result<Vec<Identity>, RegistryError> {
        Ok(self.store.list()?)
    }

    /// Remove an identity and its vector, returning the removed identity.
    pub fn remove(&self, id: &str) -> Result<Identity, RegistryError> {
        let identity = self
            .store
            .get(id)?
            .ok_or_else(|| RegistryError::IdentityNotFound(id.to_string()))?;
        if !self.store.remove(id)? {
            return Err(RegistryError::IdentityNotFound(id.to_string()));
        }
        tracing::info!(id, name = %identity.name, "identity removed");
        Ok(identity)
    }

    pub fn count(&self) -> Result<u64, RegistryError> {
        Ok(self.store.count()?)
    }
}
