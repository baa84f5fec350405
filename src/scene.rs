//! Self-contained scene used by the headless executor and by tests.
//!
//! It mirrors what the Blender add-on reports closely enough for an agent to
//! drive it: objects with transforms and mesh statistics, geometry node groups
//! referenced by NODES modifiers, and a swappable character made of one part
//! per slot.

use crate::host::{
    HostError, HostResult, MeshStats, NodeGroupInputInfo, NodeInputUpdate, ObjectInfo,
    ObjectKind, ObjectSummary, PartListing, PartSlot, SceneHost, SceneInfo, StatusReport,
};
use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const SCENE_INFO_OBJECT_LIMIT: usize = 10;
const BASE_MODEL_NAME: &str = "Base";
const MARKER_PREFIX: &str = "Marker_";

fn unit_scale() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub vertices: usize,
    pub edges: usize,
    pub polygons: usize,
    /// Local-space bounding box as `[min, max]`.
    pub bounds: [[f64; 3]; 2],
}

impl MeshData {
    fn cube(half_extent: f64) -> Self {
        Self {
            vertices: 8,
            edges: 12,
            polygons: 6,
            bounds: [[-half_extent; 3], [half_extent; 3]],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesModifier {
    pub node_group: String,
    #[serde(default)]
    pub inputs: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(default)]
    pub location: [f64; 3],
    #[serde(default)]
    pub rotation: [f64; 3],
    #[serde(default = "unit_scale")]
    pub scale: [f64; 3],
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub mesh: Option<MeshData>,
    #[serde(default)]
    pub modifiers: Vec<NodesModifier>,
}

impl SceneObject {
    fn new(name: impl Into<String>, kind: ObjectKind, location: [f64; 3]) -> Self {
        Self {
            name: name.into(),
            kind,
            location,
            rotation: [0.0; 3],
            scale: unit_scale(),
            visible: true,
            materials: Vec::new(),
            mesh: None,
            modifiers: Vec::new(),
        }
    }

    fn with_mesh(mut self, mesh: MeshData) -> Self {
        self.mesh = Some(mesh);
        self
    }

    fn with_material(mut self, material: &str) -> Self {
        self.materials.push(material.to_string());
        self
    }

    fn with_modifier(mut self, node_group: &str) -> Self {
        self.modifiers.push(NodesModifier {
            node_group: node_group.to_string(),
            inputs: Map::new(),
        });
        self
    }

    /// World-space axis-aligned box of the mesh bounds after scale, XYZ Euler
    /// rotation and translation.
    fn world_bounding_box(&self) -> Option<[[f64; 3]; 2]> {
        let mesh = self.mesh.as_ref()?;
        let [min, max] = mesh.bounds;
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for corner in 0..8 {
            let local = [
                if corner & 1 == 0 { min[0] } else { max[0] },
                if corner & 2 == 0 { min[1] } else { max[1] },
                if corner & 4 == 0 { min[2] } else { max[2] },
            ];
            let scaled = [
                local[0] * self.scale[0],
                local[1] * self.scale[1],
                local[2] * self.scale[2],
            ];
            let rotated = rotate_xyz(scaled, self.rotation);
            for axis in 0..3 {
                let world = rotated[axis] + self.location[axis];
                lo[axis] = lo[axis].min(world);
                hi[axis] = hi[axis].max(world);
            }
        }
        Some([lo, hi])
    }
}

fn rotate_xyz(v: [f64; 3], euler: [f64; 3]) -> [f64; 3] {
    let (sx, cx) = euler[0].sin_cos();
    let (sy, cy) = euler[1].sin_cos();
    let (sz, cz) = euler[2].sin_cos();
    let x = [v[0], v[1] * cx - v[2] * sx, v[1] * sx + v[2] * cx];
    let y = [x[0] * cy + x[2] * sy, x[1], -x[0] * sy + x[2] * cy];
    [y[0] * cz - y[1] * sz, y[0] * sz + y[1] * cz, y[2]]
}

fn round2(v: [f64; 3]) -> [f64; 3] {
    v.map(|c| (c * 100.0).round() / 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupInput {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<NodeGroupInput>,
}

fn attachment_point(slot: PartSlot) -> [f64; 3] {
    match slot {
        PartSlot::Head => [0.0, 0.0, 1.6],
        PartSlot::Waist => [0.0, 0.0, 1.0],
        PartSlot::Arms => [0.0, 0.0, 1.35],
        PartSlot::Legs => [0.0, 0.0, 0.5],
    }
}

fn marker_name(slot: PartSlot) -> String {
    format!("{MARKER_PREFIX}{}", slot.asset_prefix())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InMemoryScene {
    pub name: String,
    #[serde(default)]
    pub objects: Vec<SceneObject>,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,
    #[serde(default)]
    pub part_library: BTreeMap<PartSlot, Vec<String>>,
    /// Asset bound to each slot once a character has been loaded.
    #[serde(default)]
    pub character: Option<BTreeMap<PartSlot, String>>,
}

impl Default for InMemoryScene {
    fn default() -> Self {
        let city_inputs = [
            ("block_size", "VALUE", json!(10.0)),
            ("building_height_max", "VALUE", json!(40.0)),
            ("road_width", "VALUE", json!(4.0)),
            ("park_density", "VALUE", json!(0.1)),
            ("seed", "INT", json!(0)),
        ];
        let library: BTreeMap<PartSlot, Vec<String>> = PartSlot::ALL
            .into_iter()
            .map(|slot| {
                let prefix = slot.asset_prefix();
                let variants: &[&str] = match slot {
                    PartSlot::Head => &["Default", "Helmet", "Visor"],
                    PartSlot::Waist => &["Default", "Belt"],
                    PartSlot::Arms => &["Default", "Armored"],
                    PartSlot::Legs => &["Default", "Boots"],
                };
                let assets: Vec<String> = variants.iter().map(|v| format!("{prefix}_{v}")).collect();
                (slot, assets)
            })
            .collect();

        Self {
            name: "Scene".to_string(),
            objects: vec![
                SceneObject::new("Cube", ObjectKind::Mesh, [0.0, 0.0, 0.0])
                    .with_mesh(MeshData::cube(1.0))
                    .with_material("Material"),
                SceneObject::new("Camera", ObjectKind::Camera, [7.36, -6.93, 4.96]),
                SceneObject::new("Light", ObjectKind::Light, [4.08, 1.01, 5.9]),
                SceneObject::new("City", ObjectKind::Mesh, [20.0, 0.0, 0.0])
                    .with_mesh(MeshData::cube(10.0))
                    .with_modifier("NodeCity"),
            ],
            materials: vec!["Material".to_string()],
            node_groups: vec![NodeGroup {
                name: "NodeCity".to_string(),
                inputs: city_inputs
                    .into_iter()
                    .map(|(name, kind, default)| NodeGroupInput {
                        name: name.to_string(),
                        kind: kind.to_string(),
                        default,
                    })
                    .collect(),
            }],
            part_library: library,
            character: None,
        }
    }
}

impl InMemoryScene {
    /// Loads a scene description from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .wrap_err_with(|| format!("Could not open scene file at {}", path.display()))?;
        let scene = serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| format!("Could not parse scene file at {}", path.display()))?;
        Ok(scene)
    }

    fn object(&self, name: &str) -> Option<&SceneObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    fn node_group(&self, name: &str) -> HostResult<&NodeGroup> {
        self.node_groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| HostError::NodeGroupNotFound(name.to_string()))
    }

    fn library(&self, slot: PartSlot) -> &[String] {
        self.part_library.get(&slot).map(Vec::as_slice).unwrap_or_default()
    }

    fn remove_object(&mut self, name: &str) -> Option<SceneObject> {
        let index = self.objects.iter().position(|o| o.name == name)?;
        Some(self.objects.remove(index))
    }

    fn part_object(slot: PartSlot, asset: &str) -> SceneObject {
        SceneObject::new(asset, ObjectKind::Mesh, attachment_point(slot))
            .with_mesh(MeshData::cube(0.2))
    }
}

impl SceneHost for InMemoryScene {
    fn get_scene_info(&self) -> HostResult<SceneInfo> {
        let objects = self
            .objects
            .iter()
            .take(SCENE_INFO_OBJECT_LIMIT)
            .map(|o| ObjectSummary {
                name: o.name.clone(),
                kind: o.kind,
                location: round2(o.location),
            })
            .collect();
        Ok(SceneInfo {
            name: self.name.clone(),
            object_count: self.objects.len(),
            objects,
            materials_count: self.materials.len(),
        })
    }

    fn get_object_info(&self, name: &str) -> HostResult<ObjectInfo> {
        let object = self
            .object(name)
            .ok_or_else(|| HostError::ObjectNotFound(name.to_string()))?;
        Ok(ObjectInfo {
            name: object.name.clone(),
            kind: object.kind,
            location: object.location,
            rotation: object.rotation,
            scale: object.scale,
            visible: object.visible,
            materials: object.materials.clone(),
            world_bounding_box: object.world_bounding_box(),
            mesh: object.mesh.as_ref().map(|m| MeshStats {
                vertices: m.vertices,
                edges: m.edges,
                polygons: m.polygons,
            }),
        })
    }

    fn init_model(&mut self) -> HostResult<StatusReport> {
        let mut bound = BTreeMap::new();
        for slot in PartSlot::ALL {
            let asset = self
                .library(slot)
                .first()
                .cloned()
                .ok_or(HostError::EmptyLibrary(slot))?;
            bound.insert(slot, asset);
        }

        if let Some(previous) = self.character.take() {
            for asset in previous.values() {
                self.remove_object(asset);
            }
        }
        self.remove_object(BASE_MODEL_NAME);
        for slot in PartSlot::ALL {
            self.remove_object(&marker_name(slot));
        }

        self.objects.push(
            SceneObject::new(BASE_MODEL_NAME, ObjectKind::Mesh, [0.0; 3])
                .with_mesh(MeshData::cube(0.9)),
        );
        for (slot, asset) in &bound {
            self.objects.push(SceneObject::new(
                marker_name(*slot),
                ObjectKind::Empty,
                attachment_point(*slot),
            ));
            self.objects.push(Self::part_object(*slot, asset));
        }
        self.character = Some(bound);
        tracing::info!("Loaded base character with {} parts", PartSlot::ALL.len());
        Ok(StatusReport::success(
            "Loaded base model with Head, Waist, Arm and Leg markers",
        ))
    }

    fn list_parts(&self) -> HostResult<PartListing> {
        let available = PartSlot::ALL
            .into_iter()
            .map(|slot| (slot, self.library(slot).to_vec()))
            .collect();
        Ok(PartListing {
            bound: self.character.clone().unwrap_or_default(),
            available,
        })
    }

    fn replace_part(&mut self, slot: PartSlot, asset: &str) -> HostResult<StatusReport> {
        if !self.library(slot).iter().any(|a| a == asset) {
            return Err(HostError::UnknownAsset {
                slot,
                asset: asset.to_string(),
            });
        }
        let previous = self
            .character
            .as_ref()
            .ok_or(HostError::ModelNotLoaded)?
            .get(&slot)
            .cloned()
            .ok_or(HostError::ModelNotLoaded)?;
        if previous == asset {
            return Ok(StatusReport::success(format!("{slot} already uses {asset}")));
        }

        let mut replacement = Self::part_object(slot, asset);
        if let Some(old) = self.remove_object(&previous) {
            replacement.location = old.location;
            replacement.rotation = old.rotation;
            replacement.scale = old.scale;
        }
        self.objects.push(replacement);
        if let Some(character) = self.character.as_mut() {
            character.insert(slot, asset.to_string());
        }
        tracing::info!("Replaced {slot}: {previous} -> {asset}");
        Ok(StatusReport::success(format!(
            "Replaced {slot} part {previous} with {asset}"
        )))
    }

    fn has_node_group(&self, name: &str) -> bool {
        self.node_groups.iter().any(|g| g.name == name)
    }

    fn get_node_group_inputs(&self, name: &str) -> HostResult<Vec<NodeGroupInputInfo>> {
        Ok(self
            .node_group(name)?
            .inputs
            .iter()
            .map(|input| NodeGroupInputInfo {
                name: input.name.clone(),
                kind: input.kind.clone(),
                default: input.default.clone(),
            })
            .collect())
    }

    fn set_node_group_input(
        &mut self,
        group: &str,
        input: &str,
        value: JsonValue,
    ) -> HostResult<NodeInputUpdate> {
        let declared = self
            .node_groups
            .iter_mut()
            .find(|g| g.name == group)
            .ok_or_else(|| HostError::NodeGroupNotFound(group.to_string()))?
            .inputs
            .iter_mut()
            .find(|i| i.name == input)
            .ok_or_else(|| HostError::InputNotFound {
                group: group.to_string(),
                input: input.to_string(),
            })?;
        declared.default = value.clone();

        let mut modified = 0;
        for modifier in self
            .objects
            .iter_mut()
            .flat_map(|o| o.modifiers.iter_mut())
            .filter(|m| m.node_group == group)
        {
            modifier.inputs.insert(input.to_string(), value.clone());
            modified += 1;
        }
        Ok(NodeInputUpdate {
            modified_modifiers: modified,
            group: group.to_string(),
            input: input.to_string(),
            new_value: value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_with_city() -> InMemoryScene {
        let mut scene = InMemoryScene::default();
        scene.node_groups.push(NodeGroup {
            name: "CityGenerator".to_string(),
            inputs: vec![NodeGroupInput {
                name: "block_size".to_string(),
                kind: "VALUE".to_string(),
                default: json!(8.0),
            }],
        });
        scene.objects.push(
            SceneObject::new("Downtown", ObjectKind::Mesh, [0.0; 3]).with_modifier("CityGenerator"),
        );
        scene
    }

    #[test]
    fn replace_part_only_touches_its_slot() {
        let mut scene = InMemoryScene::default();
        scene.init_model().unwrap();
        let before = scene.list_parts().unwrap().bound;

        scene.replace_part(PartSlot::Head, "Head_Helmet").unwrap();
        let after = scene.list_parts().unwrap().bound;

        assert_eq!(after[&PartSlot::Head], "Head_Helmet");
        for slot in [PartSlot::Waist, PartSlot::Arms, PartSlot::Legs] {
            assert_eq!(after[&slot], before[&slot]);
        }
        assert!(scene.object("Head_Helmet").is_some());
        assert!(scene.object("Head_Default").is_none());
    }

    #[test]
    fn replace_part_keeps_the_slot_transform() {
        let mut scene = InMemoryScene::default();
        scene.init_model().unwrap();
        let head = scene
            .objects
            .iter_mut()
            .find(|o| o.name == "Head_Default")
            .unwrap();
        head.location = [0.1, 0.2, 1.7];
        head.rotation = [0.0, 0.0, 0.5];

        scene.replace_part(PartSlot::Head, "Head_Visor").unwrap();
        let visor = scene.get_object_info("Head_Visor").unwrap();
        assert_eq!(visor.location, [0.1, 0.2, 1.7]);
        assert_eq!(visor.rotation, [0.0, 0.0, 0.5]);
    }

    #[test]
    fn replace_part_requires_a_loaded_model() {
        let mut scene = InMemoryScene::default();
        let err = scene.replace_part(PartSlot::Legs, "Leg_Boots").unwrap_err();
        assert!(matches!(err, HostError::ModelNotLoaded));
    }

    #[test]
    fn replace_part_rejects_assets_from_other_slots() {
        let mut scene = InMemoryScene::default();
        scene.init_model().unwrap();
        let err = scene.replace_part(PartSlot::Head, "Leg_Boots").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Asset 'Leg_Boots' is not available for slot head"
        );
    }

    #[test]
    fn init_model_is_repeatable() {
        let mut scene = InMemoryScene::default();
        scene.init_model().unwrap();
        scene.replace_part(PartSlot::Arms, "Arm_Armored").unwrap();
        let count = scene.objects.len();

        scene.init_model().unwrap();
        assert_eq!(scene.objects.len(), count);
        assert_eq!(scene.list_parts().unwrap().bound[&PartSlot::Arms], "Arm_Default");
        assert!(scene.object("Arm_Armored").is_none());
        assert!(scene.object("Marker_Arm").is_some());
    }

    #[test]
    fn init_model_fails_without_assets() {
        let mut scene = InMemoryScene::default();
        scene.part_library.remove(&PartSlot::Waist);
        let err = scene.init_model().unwrap_err();
        assert!(matches!(err, HostError::EmptyLibrary(PartSlot::Waist)));
        assert!(scene.character.is_none());
    }

    #[test]
    fn list_parts_before_init_has_no_bindings() {
        let listing = InMemoryScene::default().list_parts().unwrap();
        assert!(listing.bound.is_empty());
        assert_eq!(listing.available[&PartSlot::Head].len(), 3);
    }

    #[test]
    fn set_then_get_node_group_input() {
        let mut scene = scene_with_city();
        let update = scene
            .set_node_group_input("CityGenerator", "block_size", json!(12.0))
            .unwrap();
        assert_eq!(update.modified_modifiers, 1);
        assert_eq!(update.new_value, json!(12.0));

        let inputs = scene.get_node_group_inputs("CityGenerator").unwrap();
        let block = inputs.iter().find(|i| i.name == "block_size").unwrap();
        assert_eq!(block.default, json!(12.0));
        let downtown = scene.object("Downtown").unwrap();
        assert_eq!(downtown.modifiers[0].inputs["block_size"], json!(12.0));
    }

    #[test]
    fn set_node_group_input_stores_values_verbatim() {
        let mut scene = scene_with_city();
        scene
            .set_node_group_input("CityGenerator", "block_size", json!("large"))
            .unwrap();
        let inputs = scene.get_node_group_inputs("CityGenerator").unwrap();
        assert_eq!(inputs[0].default, json!("large"));
    }

    #[test]
    fn unknown_group_or_input_is_an_error() {
        let mut scene = scene_with_city();
        assert!(matches!(
            scene.set_node_group_input("Forest", "density", json!(1)),
            Err(HostError::NodeGroupNotFound(_))
        ));
        assert!(matches!(
            scene.set_node_group_input("CityGenerator", "density", json!(1)),
            Err(HostError::InputNotFound { .. })
        ));
        assert!(matches!(
            scene.get_node_group_inputs("Forest"),
            Err(HostError::NodeGroupNotFound(_))
        ));
    }

    #[test]
    fn has_node_group_matches_registry() {
        let scene = scene_with_city();
        assert!(scene.has_node_group("CityGenerator"));
        assert!(scene.has_node_group("NodeCity"));
        assert!(!scene.has_node_group("citygenerator"));
        assert!(!scene.has_node_group(""));
    }

    #[test]
    fn scene_info_lists_at_most_ten_rounded_objects() {
        let mut scene = InMemoryScene::default();
        for i in 0..12 {
            scene.objects.push(SceneObject::new(
                format!("Rock.{i:03}"),
                ObjectKind::Mesh,
                [1.23456, -0.006, 2.0],
            ));
        }
        let info = scene.get_scene_info().unwrap();
        assert_eq!(info.object_count, 16);
        assert_eq!(info.objects.len(), 10);
        assert_eq!(info.materials_count, 1);
        let rock = info.objects.iter().find(|o| o.name == "Rock.000").unwrap();
        assert_eq!(rock.location, [1.23, -0.01, 2.0]);
    }

    #[test]
    fn object_info_reports_world_bounds_for_meshes() {
        let mut scene = InMemoryScene::default();
        let cube = scene.objects.iter_mut().find(|o| o.name == "Cube").unwrap();
        cube.location = [1.0, 2.0, 3.0];
        cube.scale = [2.0, 1.0, 1.0];
        cube.rotation = [0.0, 0.0, std::f64::consts::FRAC_PI_2];

        let info = scene.get_object_info("Cube").unwrap();
        let [min, max] = info.world_bounding_box.unwrap();
        let expected = [[0.0, 0.0, 2.0], [2.0, 4.0, 4.0]];
        for axis in 0..3 {
            assert!((min[axis] - expected[0][axis]).abs() < 1e-9, "{min:?}");
            assert!((max[axis] - expected[1][axis]).abs() < 1e-9, "{max:?}");
        }
        assert_eq!(info.mesh.unwrap().polygons, 6);
        assert_eq!(info.materials, vec!["Material".to_string()]);
    }

    #[test]
    fn object_info_for_non_mesh_has_no_bounds() {
        let scene = InMemoryScene::default();
        let camera = scene.get_object_info("Camera").unwrap();
        assert!(camera.world_bounding_box.is_none());
        assert!(camera.mesh.is_none());
        assert!(matches!(
            scene.get_object_info("Ghost"),
            Err(HostError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn fixture_files_fill_in_defaults() {
        let path = std::env::temp_dir().join(format!("scene-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{
                "name": "Fixture",
                "objects": [{"name": "Plane", "type": "MESH"}],
                "node_groups": [{"name": "Scatter", "inputs": [
                    {"name": "count", "type": "INT", "default": 5}
                ]}],
                "part_library": {"head": ["Head_A"], "waist": ["Waist_A"],
                                 "arms": ["Arm_A"], "legs": ["Leg_A"]}
            }"#,
        )
        .unwrap();
        let mut scene = InMemoryScene::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let plane = scene.get_object_info("Plane").unwrap();
        assert_eq!(plane.scale, [1.0, 1.0, 1.0]);
        assert!(plane.visible);
        assert!(scene.has_node_group("Scatter"));
        scene.init_model().unwrap();
        assert_eq!(scene.list_parts().unwrap().bound[&PartSlot::Legs], "Leg_A");
    }

    #[test]
    fn missing_fixture_file_is_reported() {
        let err = InMemoryScene::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.to_string().contains("Could not open scene file"));
    }
}
