use crate::recognition::domain::embedding::Embedding;
use crate::recognition::domain::mask_classifier::MaskLabel;
use crate::shared::frame::Frame;
use crate::shared::region::Region;

/// The pixels of one detected face and where they came from.
#[derive(Clone, Debug)]
pub struct FaceCrop {
    pub region: Region,
    pub image: Frame,
}

/// What the pipeline concluded about one face.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub region: Region,
    /// Best gallery match, if an identity gallery is configured and matched.
    pub identity: Option<String>,
    /// `None` when mask detection is disabled.
    pub mask: Option<MaskLabel>,
    pub embedding: Embedding,
}

/// Receives the crops of every analysed frame, in detector order.
///
/// Called exactly once per admitted frame whose detection succeeded, from the
/// analysis worker thread, possibly with an empty list.
pub trait FaceResultConsumer: Send {
    fn on_result(&mut self, crops: Vec<FaceCrop>);
}

impl<F> FaceResultConsumer for F
where
    F: FnMut(Vec<FaceCrop>) + Send,
{
    fn on_result(&mut self, crops: Vec<FaceCrop>) {
        self(crops)
    }
}
