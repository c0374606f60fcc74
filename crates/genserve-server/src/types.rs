use std::sync::Arc;

use genserve_core::Servable;

/// Servables shared by every handler, in configuration order.
#[derive(Clone)]
pub struct AppState {
    pub servables: Arc<Vec<Arc<Servable>>>,
}

impl AppState {
    pub fn new(servables: Vec<Servable>) -> Self {
        let servables = servables.into_iter().map(Arc::new).collect();
        Self {
            servables: Arc::new(servables),
        }
    }

    /// The servable named `model`. An absent `model` selects the first servable.
    pub fn find(&self, model: Option<&str>) -> Option<Arc<Servable>> {
        match model {
            Some(model) => self
                .servables
                .iter()
                .find(|servable| servable.name() == model)
                .cloned(),
            None => self.servables.first().cloned(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.servables.iter().map(|servable| servable.name()).collect();
        f.debug_struct("AppState").field("servables", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use genserve_core::{initialize, ServableConfig};

    use super::*;

    fn servable(name: &str) -> Servable {
        let config = ServableConfig {
            name: name.into(),
            models_path: "does/not/exist".into(),
            ..Default::default()
        };
        initialize(&config).expect("test")
    }

    #[test]
    fn test_find_servable() {
        let state = AppState::new(vec![servable("first"), servable("second")]);
        assert_eq!(state.find(Some("second")).map(|s| s.name().to_owned()), Some("second".into()));
        assert_eq!(state.find(None).map(|s| s.name().to_owned()), Some("first".into()));
        assert!(state.find(Some("missing")).is_none());
    }
}
