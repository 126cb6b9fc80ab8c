use super::PutType;

/// Standard experiment events bound at startup and on table reset.
/// All use time encoding `'c'`.
pub const DEFAULT_NAMES: &[(u8, &str, PutType)] = &[
    (0, "Magic Number", PutType::Null),
    (1, "Event Name", PutType::String),
    (2, "File I/O", PutType::String),
    (3, "User Interaction", PutType::Null),
    (4, "State System Trace", PutType::String),
    (5, "Parameter Set", PutType::String),
    (16, "Time Stamped Spike", PutType::Long),
    (17, "DIS-1 Hardware Spike", PutType::Long),
    (18, "Name", PutType::String),
    (19, "Start Obs Period", PutType::Long),
    (20, "End Obs Period", PutType::Long),
    (21, "ISI", PutType::Long),
    (22, "Trial Type", PutType::Long),
    (23, "Obs Period Type", PutType::Long),
    (24, "EM Log", PutType::Long),
    (25, "Fixspot", PutType::Float),
    (26, "EM Params", PutType::Float),
    (27, "Stimulus", PutType::Long),
    (28, "Pattern", PutType::Long),
    (29, "Stimulus Type", PutType::Long),
    (30, "Sample", PutType::Long),
    (31, "Probe", PutType::Long),
    (32, "Cue", PutType::Long),
    (33, "Target", PutType::Long),
    (34, "Distractor", PutType::Long),
    (35, "Sound Event", PutType::Long),
    (36, "Fixation", PutType::Long),
    (37, "Response", PutType::Long),
    (38, "Saccade", PutType::Long),
    (39, "Decide", PutType::Long),
    (40, "EOT", PutType::Long),
    (41, "Abort", PutType::Long),
    (42, "Reward", PutType::Long),
    (43, "Delay", PutType::Long),
    (44, "Punish", PutType::Long),
    (45, "Physio Params", PutType::Float),
    (46, "Mri", PutType::Long),
    (47, "Stimulator Signal", PutType::Long),
    (128, "Target Name", PutType::String),
    (129, "Scene Name", PutType::String),
    (130, "Saccade Data", PutType::Float),
    (131, "Stimulus Trigger", PutType::Float),
    (132, "Movie Name", PutType::String),
    (133, "Electrical Stimulation", PutType::Long),
    (134, "Second Chance", PutType::Long),
    (135, "Second Response", PutType::Long),
    (136, "Swap Buffer", PutType::Float),
    (137, "Stim Data", PutType::String),
    (138, "Digital Input Status", PutType::Long),
];
