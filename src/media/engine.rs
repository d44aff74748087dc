use super::vad::{
    VADOption, VadBackend, VadContext, VadType, amplitude::AmplitudeVad, socket::NeuralVad,
    spectral::SpectralVad,
};
use anyhow::Result;
use std::collections::HashMap;

pub type FnCreateVadBackend = fn(VADOption, VadContext) -> Result<Box<dyn VadBackend>>;

/// Factory registry for VAD backends. Backends are selected once, by type,
/// through this table; adding a backend is a registration, not another arm
/// in a dispatch chain.
pub struct StreamEngine {
    vad_creators: HashMap<VadType, FnCreateVadBackend>,
}

impl Default for StreamEngine {
    fn default() -> Self {
        let mut engine = Self::new();
        engine.register_vad(VadType::Amplitude, AmplitudeVad::create);
        engine.register_vad(VadType::Spectral, SpectralVad::create);
        engine.register_vad(VadType::NeuralLocal, NeuralVad::create_local);
        engine.register_vad(VadType::NeuralServer, NeuralVad::create_server);
        engine
    }
}

impl StreamEngine {
    pub fn new() -> Self {
        Self {
            vad_creators: HashMap::new(),
        }
    }

    pub fn register_vad(&mut self, vad_type: VadType, creator: FnCreateVadBackend) -> &mut Self {
        self.vad_creators.insert(vad_type, creator);
        self
    }

    pub fn create_vad_backend(
        &self,
        option: VADOption,
        ctx: VadContext,
    ) -> Result<Box<dyn VadBackend>> {
        let creator = self.vad_creators.get(&option.r#type);
        if let Some(creator) = creator {
            creator(option, ctx)
        } else {
            Err(anyhow::anyhow!("VAD type not found: {}", option.r#type))
        }
    }
}
