pub mod angular;
pub mod ikeda_carpenter;
pub mod joint;
pub mod tof;

pub use angular::{
    AngularFitMode,
    AngularProfileFitter,
    AngularProfileModel,
};
pub use joint::{
    JointProfile,
    ProfileComposer,
};
pub use tof::{
    TofProfileFitter,
    TofProfileModel,
};
